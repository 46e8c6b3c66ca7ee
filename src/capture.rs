use std::cell::RefCell;
use std::rc::Rc;

use polars::prelude::*;

use crate::datafeed::{Channel, ChannelType, DatafeedBus, MetaItem, Packet};

pub const SAMPLE_COLUMN_NAME: &str = "sample";
pub const TIME_COLUMN_NAME: &str = "time";

/// Logic samples gathered from a datafeed, viewable as a [`DataFrame`].
#[derive(Debug, Clone, Default)]
pub struct LogicCapture {
    channels: Vec<Channel>,
    samplerate: u64,
    unitsize: usize,
    data: Vec<u8>,
    triggers: Vec<usize>,
}

impl LogicCapture {
    pub fn new(channels: &[Channel]) -> Self {
        Self {
            channels: channels
                .iter()
                .filter(|c| c.kind == ChannelType::Logic)
                .cloned()
                .collect(),
            ..Self::default()
        }
    }

    /// Register a callback on `bus` that feeds a shared capture.
    pub fn attach(channels: &[Channel], bus: &mut DatafeedBus) -> Rc<RefCell<Self>> {
        let capture = Rc::new(RefCell::new(Self::new(channels)));
        let sink = Rc::clone(&capture);
        bus.add_callback(move |packet: &Packet| sink.borrow_mut().push(packet));
        capture
    }

    pub fn push(&mut self, packet: &Packet) {
        match packet {
            Packet::Meta(items) => {
                for item in items {
                    if let MetaItem::Samplerate(rate) = item {
                        self.samplerate = *rate;
                    }
                }
            }
            Packet::Logic(logic) => {
                if self.unitsize == 0 {
                    self.unitsize = logic.unitsize;
                }
                if logic.unitsize != self.unitsize {
                    log::warn!(
                        "Dropping logic packet with unitsize {} (capture uses {})",
                        logic.unitsize,
                        self.unitsize
                    );
                    return;
                }
                self.data.extend_from_slice(&logic.data);
            }
            Packet::Trigger => self.triggers.push(self.num_samples()),
            _ => {}
        }
    }

    pub fn samplerate(&self) -> u64 {
        self.samplerate
    }

    pub fn num_samples(&self) -> usize {
        if self.unitsize == 0 {
            0
        } else {
            self.data.len() / self.unitsize
        }
    }

    /// Sample positions at which trigger markers arrived.
    pub fn triggers(&self) -> &[usize] {
        &self.triggers
    }

    fn bit(&self, sample: usize, index: usize) -> bool {
        self.data
            .get(sample * self.unitsize + index / 8)
            .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
    }

    /// One row per sample: `sample`, `time` in seconds (only when the
    /// samplerate is known), then one boolean column per enabled channel.
    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::span!("capture_to_dataframe");

        let samples = self.num_samples();
        let enabled: Vec<&Channel> = self.channels.iter().filter(|c| c.enabled).collect();

        let mut columns: Vec<Column> = Vec::with_capacity(enabled.len() + 1);
        let index: Vec<u64> = (0..samples as u64).collect();
        columns.push(Series::new(SAMPLE_COLUMN_NAME.into(), index).into());
        for channel in &enabled {
            let values: Vec<bool> = (0..samples).map(|s| self.bit(s, channel.index)).collect();
            columns.push(Series::new(channel.name.as_str().into(), values).into());
        }
        let df = DataFrame::new(columns)?;

        if self.samplerate == 0 {
            return Ok(df);
        }

        let mut selection = vec![col(SAMPLE_COLUMN_NAME), col(TIME_COLUMN_NAME)];
        selection.extend(enabled.iter().map(|c| col(c.name.as_str())));
        df.lazy()
            .with_columns([(col(SAMPLE_COLUMN_NAME).cast(DataType::Float64)
                * lit(1.0 / self.samplerate as f64))
            .alias(TIME_COLUMN_NAME)])
            .select(selection)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafeed::Logic;

    fn channels() -> Vec<Channel> {
        vec![
            Channel::logic(0, "D0"),
            Channel::logic(1, "D1").disabled(),
            Channel::logic(9, "D9"),
            Channel::analog(0, "A0"),
        ]
    }

    #[test]
    fn test_dataframe_columns() {
        let mut capture = LogicCapture::new(&channels());
        capture.push(&Packet::Meta(vec![MetaItem::Samplerate(1_000)]));
        capture.push(&Packet::Logic(Logic::new(2, vec![0x01, 0x00, 0x00, 0x02])));
        capture.push(&Packet::Trigger);
        capture.push(&Packet::Logic(Logic::new(2, vec![0x03, 0x02])));

        assert_eq!(capture.num_samples(), 3);
        assert_eq!(capture.triggers(), &[2]);

        let df = capture.to_dataframe().unwrap();
        let names: Vec<&str> = df.get_column_names().iter().map(|n| n.as_str()).collect();
        assert_eq!(names, vec!["sample", "time", "D0", "D9"]);
        assert_eq!(df.height(), 3);

        let d0: Vec<Option<bool>> = df.column("D0").unwrap().bool().unwrap().into_iter().collect();
        assert_eq!(d0, vec![Some(true), Some(false), Some(true)]);
        let d9: Vec<Option<bool>> = df.column("D9").unwrap().bool().unwrap().into_iter().collect();
        assert_eq!(d9, vec![Some(false), Some(true), Some(true)]);

        let time: Vec<Option<f64>> = df.column("time").unwrap().f64().unwrap().into_iter().collect();
        assert_eq!(time, vec![Some(0.0), Some(0.001), Some(0.002)]);
    }

    #[test]
    fn test_mismatched_unitsize_dropped() {
        let mut capture = LogicCapture::new(&channels());
        capture.push(&Packet::Logic(Logic::new(1, vec![1, 0])));
        capture.push(&Packet::Logic(Logic::new(2, vec![1, 0])));
        assert_eq!(capture.num_samples(), 2);

        // No samplerate seen: no time column.
        let df = capture.to_dataframe().unwrap();
        assert!(df.column(TIME_COLUMN_NAME).is_err());
    }

    #[test]
    fn test_attach_to_bus() {
        let mut bus = DatafeedBus::new();
        let capture = LogicCapture::attach(&channels(), &mut bus);
        bus.publish(Packet::Logic(Logic::new(2, vec![0, 0]))).unwrap();
        assert_eq!(capture.borrow().num_samples(), 1);
    }
}
