//! Software trigger over raw logic sample buffers.
//!
//! Samples are fed in device-sized buffers. Until the trigger fires, the
//! most recent `pre_trigger_samples` samples are remembered; when the last
//! stage matches they are published ahead of the trigger marker, and the
//! caller continues sending from the returned offset.

use std::collections::VecDeque;

use crate::datafeed::{Channel, ChannelType, DatafeedBus, DatafeedError, Logic, Packet};
use crate::trigger::{MatchKind, Trigger, TriggerError, TriggerMatch};

#[derive(Debug, thiserror::Error)]
pub enum SoftTriggerError {
    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Datafeed error: {0}")]
    Datafeed(#[from] DatafeedError),
}

/// Where a trigger fired within the buffer passed to [`SoftTrigger::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerHit {
    /// Sample index of the matching sample.
    pub offset: usize,
    /// Number of samples published before the trigger marker.
    pub pre_trigger_samples: usize,
}

#[derive(Debug)]
pub struct SoftTrigger {
    trigger: Trigger,
    unitsize: usize,
    cur_stage: usize,
    pre_trigger: VecDeque<u8>,
    pre_trigger_capacity: usize,
    /// Last sample of the previous buffer, for edge matches at index 0.
    prev_sample: Option<Vec<u8>>,
}

impl SoftTrigger {
    /// `channels` are all channels of the device; only logic ones count
    /// towards the sample width.
    pub fn new(
        trigger: Trigger,
        channels: &[Channel],
        pre_trigger_samples: usize,
    ) -> Result<Self, SoftTriggerError> {
        trigger.verify()?;
        if let Some(m) = trigger
            .stages
            .iter()
            .flat_map(|stage| &stage.matches)
            .find(|m| m.channel.kind != ChannelType::Logic)
        {
            return Err(TriggerError::InvalidArgument(format!(
                "soft trigger only handles logic channels, got '{}'",
                m.channel.name
            ))
            .into());
        }

        let logic_channels = channels
            .iter()
            .filter(|c| c.kind == ChannelType::Logic)
            .count();
        let unitsize = logic_channels.div_ceil(8).max(1);

        Ok(Self {
            trigger,
            unitsize,
            cur_stage: 0,
            pre_trigger: VecDeque::with_capacity(unitsize * pre_trigger_samples),
            pre_trigger_capacity: unitsize * pre_trigger_samples,
            prev_sample: None,
        })
    }

    pub fn unitsize(&self) -> usize {
        self.unitsize
    }

    pub fn current_stage(&self) -> usize {
        self.cur_stage
    }

    /// Samples currently held for pre-trigger output.
    pub fn buffered_samples(&self) -> usize {
        self.pre_trigger.len() / self.unitsize
    }

    /// Forget all progress, as if no buffer had been seen.
    pub fn reset(&mut self) {
        self.cur_stage = 0;
        self.pre_trigger.clear();
        self.prev_sample = None;
    }

    /// Scan `buf` for the trigger condition.
    ///
    /// On a hit the pre-trigger samples and a [`Packet::Trigger`] are
    /// published on `bus`, and the trigger re-arms. Without a hit the whole
    /// buffer goes into the pre-trigger history.
    pub fn check(
        &mut self,
        buf: &[u8],
        bus: &mut DatafeedBus,
    ) -> Result<Option<TriggerHit>, SoftTriggerError> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::span!("soft_trigger_check");

        let unitsize = self.unitsize;
        let num_samples = buf.len() / unitsize;
        let mut i = 0;

        while i < num_samples {
            let stage = &self.trigger.stages[self.cur_stage];
            if stage.matches.is_empty() {
                return Err(TriggerError::EmptyStage(stage.index).into());
            }

            let sample = &buf[i * unitsize..(i + 1) * unitsize];
            let prev = if i > 0 {
                Some(&buf[(i - 1) * unitsize..i * unitsize])
            } else {
                self.prev_sample.as_deref()
            };

            let matched = stage
                .matches
                .iter()
                .filter(|m| m.channel.enabled)
                .all(|m| sample_matches(m, sample, prev));

            if matched {
                if self.cur_stage + 1 < self.trigger.stages.len() {
                    self.cur_stage += 1;
                } else {
                    self.append(&buf[..i * unitsize]);
                    let pre_trigger_samples = self.flush(bus)?;
                    log::debug!(
                        "Soft trigger fired at sample {i} with {pre_trigger_samples} pre-trigger samples"
                    );
                    bus.publish(Packet::Trigger)?;
                    self.cur_stage = 0;
                    self.prev_sample = None;
                    return Ok(Some(TriggerHit {
                        offset: i,
                        pre_trigger_samples,
                    }));
                }
            } else if self.cur_stage > 0 {
                // The failed sample may still start the sequence over;
                // resume just after the sample that matched stage 0.
                let back = self.cur_stage;
                self.cur_stage = 0;
                i = (i + 1).saturating_sub(back);
                continue;
            }
            i += 1;
        }

        if num_samples > 0 {
            self.prev_sample = Some(buf[(num_samples - 1) * unitsize..num_samples * unitsize].to_vec());
        }
        self.append(&buf[..num_samples * unitsize]);
        Ok(None)
    }

    fn append(&mut self, data: &[u8]) {
        if self.pre_trigger_capacity == 0 {
            return;
        }
        let keep = data.len().min(self.pre_trigger_capacity);
        self.pre_trigger.extend(&data[data.len() - keep..]);
        let excess = self.pre_trigger.len().saturating_sub(self.pre_trigger_capacity);
        self.pre_trigger.drain(..excess);
    }

    fn flush(&mut self, bus: &mut DatafeedBus) -> Result<usize, DatafeedError> {
        if self.pre_trigger.is_empty() {
            return Ok(0);
        }
        let data: Vec<u8> = self.pre_trigger.drain(..).collect();
        let samples = data.len() / self.unitsize;
        bus.publish(Packet::Logic(Logic::new(self.unitsize, data)))?;
        Ok(samples)
    }
}

fn bit_of(sample: &[u8], index: usize) -> bool {
    sample
        .get(index / 8)
        .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
}

fn sample_matches(m: &TriggerMatch, sample: &[u8], prev: Option<&[u8]>) -> bool {
    let bit = bit_of(sample, m.channel.index);
    match m.kind {
        MatchKind::Zero => !bit,
        MatchKind::One => bit,
        kind if kind.is_edge() => {
            let Some(prev) = prev else {
                return false;
            };
            let prev_bit = bit_of(prev, m.channel.index);
            match kind {
                MatchKind::Rising => !prev_bit && bit,
                MatchKind::Falling => prev_bit && !bit,
                _ => prev_bit != bit,
            }
        }
        _ => false,
    }
}
