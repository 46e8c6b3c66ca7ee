//! Trigger definitions: stages of per-channel matches, built by hand or from patterns.

use crate::datafeed::{Channel, ChannelType};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TriggerError {
    #[error("No trigger stages defined")]
    NoStages,

    #[error("Stage {0} has no matches defined")]
    EmptyStage(usize),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Condition a channel has to meet for its stage to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MatchKind {
    Zero = 1,
    One,
    Rising,
    Falling,
    Edge,
    Over,
    Under,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zero => "0",
            Self::One => "1",
            Self::Rising => "r",
            Self::Falling => "f",
            Self::Edge => "e",
            Self::Over => ">",
            Self::Under => "<",
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0' => Some(Self::Zero),
            '1' => Some(Self::One),
            'r' | 'R' => Some(Self::Rising),
            'f' | 'F' => Some(Self::Falling),
            'e' | 'E' => Some(Self::Edge),
            '>' => Some(Self::Over),
            '<' => Some(Self::Under),
            _ => None,
        }
    }

    /// Edge kinds compare against the previous sample.
    pub fn is_edge(&self) -> bool {
        matches!(self, Self::Rising | Self::Falling | Self::Edge)
    }

    /// Whether this kind makes sense on a channel of type `kind`.
    pub fn applies_to(&self, kind: ChannelType) -> bool {
        match kind {
            ChannelType::Logic => matches!(
                self,
                Self::Zero | Self::One | Self::Rising | Self::Falling | Self::Edge
            ),
            ChannelType::Analog => matches!(
                self,
                Self::Rising | Self::Falling | Self::Over | Self::Under
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerMatch {
    pub channel: Channel,
    pub kind: MatchKind,
    /// Threshold for analog matches, unused for logic ones.
    pub value: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerStage {
    pub index: usize,
    pub matches: Vec<TriggerMatch>,
}

impl TriggerStage {
    /// Add a condition on `channel`. A later match on the same channel
    /// replaces the earlier one.
    pub fn add_match(
        &mut self,
        channel: &Channel,
        kind: MatchKind,
        value: f32,
    ) -> Result<(), TriggerError> {
        if !kind.applies_to(channel.kind) {
            log::error!(
                "Invalid trigger match {} for {} channel '{}'",
                kind.as_str(),
                channel.kind.as_str(),
                channel.name
            );
            return Err(TriggerError::InvalidArgument(format!(
                "match '{}' is not valid for {} channel '{}'",
                kind.as_str(),
                channel.kind.as_str(),
                channel.name
            )));
        }

        self.matches
            .retain(|m| !(m.channel.kind == channel.kind && m.channel.index == channel.index));
        self.matches.push(TriggerMatch {
            channel: channel.clone(),
            kind,
            value,
        });
        Ok(())
    }
}

/// A sequence of stages, each an AND of channel matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trigger {
    pub name: Option<String>,
    pub stages: Vec<TriggerStage>,
}

impl Trigger {
    pub fn new(name: Option<&str>) -> Self {
        Self {
            name: name.map(str::to_string),
            stages: Vec::new(),
        }
    }

    pub fn add_stage(&mut self) -> &mut TriggerStage {
        let index = self.stages.len();
        self.stages.push(TriggerStage {
            index,
            matches: Vec::new(),
        });
        &mut self.stages[index]
    }

    /// Reject triggers that could never fire.
    pub fn verify(&self) -> Result<(), TriggerError> {
        if self.stages.is_empty() {
            log::error!("No trigger stages defined");
            return Err(TriggerError::NoStages);
        }

        log::trace!("Checking trigger:");
        for stage in &self.stages {
            if stage.matches.is_empty() {
                log::error!("Stage {} has no matches defined", stage.index);
                return Err(TriggerError::EmptyStage(stage.index));
            }
            for m in &stage.matches {
                log::trace!(
                    "Stage {} match on channel {}, match {}",
                    stage.index,
                    m.channel.name,
                    m.kind.as_str()
                );
            }
        }
        Ok(())
    }

    pub fn builder() -> TriggerBuilder {
        TriggerBuilder::new()
    }

    /// One stage per pattern; character `k` of a pattern applies to logic
    /// channel `k`. `x` (or `X`, `.`) means don't care.
    ///
    /// ```
    /// use labfeed_rs::datafeed::Channel;
    /// use labfeed_rs::trigger::Trigger;
    ///
    /// let channels = [Channel::logic(0, "D0"), Channel::logic(1, "D1")];
    /// let trigger = Trigger::from_patterns(&channels, &["0x", "1r"]).unwrap();
    /// assert_eq!(trigger.stages.len(), 2);
    /// assert_eq!(trigger.stages[1].matches.len(), 2);
    /// ```
    pub fn from_patterns(channels: &[Channel], patterns: &[&str]) -> Result<Self, TriggerError> {
        let logic: Vec<&Channel> = channels
            .iter()
            .filter(|c| c.kind == ChannelType::Logic)
            .collect();

        let mut trigger = Self::new(None);
        for pattern in patterns {
            let stage = trigger.add_stage();
            for (position, c) in pattern.chars().enumerate() {
                if matches!(c, 'x' | 'X' | '.') {
                    continue;
                }
                let channel = logic.get(position).ok_or_else(|| {
                    TriggerError::InvalidArgument(format!("no logic channel at position {position}"))
                })?;
                let kind = MatchKind::from_char(c).ok_or_else(|| {
                    TriggerError::InvalidArgument(format!("unknown match character '{c}'"))
                })?;
                stage.add_match(channel, kind, 0.0)?;
            }
        }
        trigger.verify()?;
        Ok(trigger)
    }
}

/// Fluent construction of a [`Trigger`], stage by stage.
///
/// The first invalid match is remembered and reported by [`build`](Self::build).
#[derive(Debug)]
pub struct TriggerBuilder {
    trigger: Trigger,
    error: Option<TriggerError>,
}

impl TriggerBuilder {
    pub fn new() -> Self {
        Self {
            trigger: Trigger::new(None),
            error: None,
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.trigger.name = Some(name.to_string());
        self
    }

    /// Start a new stage; following matches go into it.
    pub fn stage(mut self) -> Self {
        self.trigger.add_stage();
        self
    }

    pub fn on(mut self, channel: &Channel, kind: MatchKind, value: f32) -> Self {
        if self.error.is_some() {
            return self;
        }
        if self.trigger.stages.is_empty() {
            self.trigger.add_stage();
        }
        let last = self.trigger.stages.len() - 1;
        if let Err(e) = self.trigger.stages[last].add_match(channel, kind, value) {
            self.error = Some(e);
        }
        self
    }

    pub fn zero(self, channel: &Channel) -> Self {
        self.on(channel, MatchKind::Zero, 0.0)
    }

    pub fn one(self, channel: &Channel) -> Self {
        self.on(channel, MatchKind::One, 0.0)
    }

    pub fn rising(self, channel: &Channel) -> Self {
        self.on(channel, MatchKind::Rising, 0.0)
    }

    pub fn falling(self, channel: &Channel) -> Self {
        self.on(channel, MatchKind::Falling, 0.0)
    }

    pub fn edge(self, channel: &Channel) -> Self {
        self.on(channel, MatchKind::Edge, 0.0)
    }

    pub fn over(self, channel: &Channel, value: f32) -> Self {
        self.on(channel, MatchKind::Over, value)
    }

    pub fn under(self, channel: &Channel, value: f32) -> Self {
        self.on(channel, MatchKind::Under, value)
    }

    pub fn build(self) -> Result<Trigger, TriggerError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.trigger.verify()?;
        Ok(self.trigger)
    }
}

impl Default for TriggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_kind_validation() {
        let logic = Channel::logic(0, "D0");
        let analog = Channel::analog(0, "A0");
        let mut trigger = Trigger::new(Some("t"));
        let stage = trigger.add_stage();

        assert!(stage.add_match(&logic, MatchKind::Edge, 0.0).is_ok());
        assert!(matches!(
            stage.add_match(&logic, MatchKind::Over, 1.0),
            Err(TriggerError::InvalidArgument(_))
        ));
        assert!(stage.add_match(&analog, MatchKind::Under, 1.5).is_ok());
        assert!(matches!(
            stage.add_match(&analog, MatchKind::One, 0.0),
            Err(TriggerError::InvalidArgument(_))
        ));
        assert_eq!(stage.matches.len(), 2);
    }

    #[test]
    fn test_later_match_replaces_earlier() {
        let d0 = Channel::logic(0, "D0");
        let mut trigger = Trigger::new(None);
        let stage = trigger.add_stage();
        stage.add_match(&d0, MatchKind::Zero, 0.0).unwrap();
        stage.add_match(&d0, MatchKind::One, 0.0).unwrap();
        assert_eq!(stage.matches.len(), 1);
        assert_eq!(stage.matches[0].kind, MatchKind::One);
    }

    #[test]
    fn test_verify_rejects_empty_triggers() {
        let mut trigger = Trigger::new(None);
        assert_eq!(trigger.verify(), Err(TriggerError::NoStages));
        trigger.add_stage();
        assert_eq!(trigger.verify(), Err(TriggerError::EmptyStage(0)));
    }

    #[test]
    fn test_builder_collects_stages() {
        let d0 = Channel::logic(0, "D0");
        let d1 = Channel::logic(1, "D1");
        let trigger = Trigger::builder()
            .name("burst")
            .zero(&d0)
            .one(&d1)
            .stage()
            .rising(&d0)
            .build()
            .unwrap();

        assert_eq!(trigger.name.as_deref(), Some("burst"));
        assert_eq!(trigger.stages.len(), 2);
        assert_eq!(trigger.stages[0].matches.len(), 2);
        assert_eq!(trigger.stages[1].index, 1);
    }

    #[test]
    fn test_builder_reports_first_error() {
        let analog = Channel::analog(0, "A0");
        let err = Trigger::builder().one(&analog).build().unwrap_err();
        assert!(matches!(err, TriggerError::InvalidArgument(_)));

        let d0 = Channel::logic(0, "D0");
        let err = Trigger::builder().zero(&d0).stage().build().unwrap_err();
        assert_eq!(err, TriggerError::EmptyStage(1));
    }

    #[test]
    fn test_patterns() {
        let channels = [
            Channel::logic(0, "D0"),
            Channel::analog(0, "A0"),
            Channel::logic(1, "D1"),
        ];
        let trigger = Trigger::from_patterns(&channels, &["x1", "f."]).unwrap();
        assert_eq!(trigger.stages[0].matches[0].channel.name, "D1");
        assert_eq!(trigger.stages[1].matches[0].kind, MatchKind::Falling);

        assert!(Trigger::from_patterns(&channels, &["001"]).is_err());
        assert!(Trigger::from_patterns(&channels, &["z"]).is_err());
        assert_eq!(
            Trigger::from_patterns(&channels, &["xx"]),
            Err(TriggerError::EmptyStage(0))
        );
    }
}
