//! Session archives: captured samples plus the metadata needed to replay them.
//!
//! A session is a zip archive with these entries:
//!
//! - `version`: ASCII decimal format version (1 or 2 are understood).
//! - `metadata`: a [`KeyFile`] with a `[global]` section and one
//!   `[device N]` section per captured device.
//! - `logic-1` or `logic-1-1`, `logic-1-2`, ...: raw logic samples,
//!   `unitsize` bytes each.
//! - `analog-1-K` (or chunked `analog-1-K-1`, ...): little-endian `f32`
//!   samples of analog channel `K`, numbered after the logic probes.
//!
//! Appends never rewrite sample data in place; a failed append can leave
//! a partially written entry behind.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::datafeed::{
    Analog, AnalogMeaning, Channel, ChannelType, DatafeedBus, DatafeedError, Logic, MetaItem,
    MqFlags, Packet, Quantity, Unit,
};
use crate::keyfile::{KeyFile, KeyFileError};
use crate::units::{parse_size, samplerate_string};

/// Highest `version` this crate reads and the one it writes.
pub const SESSION_FORMAT_VERSION: u64 = 2;

/// Default size of written chunks and of replayed packets.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

const LOGIC_CAPTURE: &str = "logic-1";
const DEVICE_SECTION: &str = "device 1";

#[derive(Debug, thiserror::Error)]
pub enum SessionFileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Metadata error: {0}")]
    KeyFile(#[from] KeyFileError),

    #[error("Datafeed error: {0}")]
    Datafeed(#[from] DatafeedError),

    #[error("Not a session file: {0}")]
    NotASession(String),

    #[error("Cannot handle session file version {0}")]
    UnsupportedVersion(u64),

    #[error("Missing entry '{0}' in session file")]
    MissingEntry(String),

    #[error("Cannot store packet: {0}")]
    UnsupportedPacket(String),

    #[error("Bad metadata: {0}")]
    BadMetadata(String),
}

pub type Result<T> = std::result::Result<T, SessionFileError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWriterConfig {
    /// Largest entry written by one append; longer data is split.
    pub chunk_bytes: usize,
}

impl Default for SessionWriterConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: CHUNK_SIZE,
        }
    }
}

impl SessionWriterConfig {
    pub fn chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes.max(1);
        self
    }
}

fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

fn entry_names<R: Read + Seek>(archive: &ZipArchive<R>) -> HashSet<String> {
    archive.file_names().map(str::to_string).collect()
}

fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut entry = archive.by_name(name).map_err(|e| match e {
        zip::result::ZipError::FileNotFound => SessionFileError::MissingEntry(name.to_string()),
        other => other.into(),
    })?;
    let mut data = Vec::new();
    entry.read_to_end(&mut data)?;
    Ok(data)
}

/// Entry names holding the data of `base`, in replay order.
fn capture_entries(names: &HashSet<String>, base: &str) -> Vec<String> {
    if names.contains(base) {
        return vec![base.to_string()];
    }
    (1..)
        .map(|chunk| format!("{base}-{chunk}"))
        .take_while(|name| names.contains(name))
        .collect()
}

/// Writes a session archive incrementally.
#[derive(Debug)]
pub struct SessionWriter {
    path: PathBuf,
    config: SessionWriterConfig,
    /// Enabled analog channel names, in archive numbering order.
    analog_names: Vec<String>,
    first_analog_index: usize,
    unitsize_recorded: bool,
}

impl SessionWriter {
    /// Create the archive at `path` with its `version` and `metadata`
    /// entries, replacing any existing file.
    pub fn save_init(
        path: impl AsRef<Path>,
        channels: &[Channel],
        samplerate: u64,
        config: SessionWriterConfig,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let logic: Vec<&Channel> = channels
            .iter()
            .filter(|c| c.kind == ChannelType::Logic)
            .collect();
        let enabled_logic = logic.iter().filter(|c| c.enabled).count();
        let analog_names: Vec<String> = channels
            .iter()
            .filter(|c| c.kind == ChannelType::Analog && c.enabled)
            .map(|c| c.name.clone())
            .collect();

        // Analog numbering continues after every logic probe, enabled or not.
        let first_analog_index = if enabled_logic > 0 { logic.len() + 1 } else { 1 };

        let mut meta = KeyFile::new();
        meta.set("global", "sigrok version", env!("CARGO_PKG_VERSION"));
        if enabled_logic > 0 {
            meta.set(DEVICE_SECTION, "capturefile", LOGIC_CAPTURE);
            meta.set(DEVICE_SECTION, "total probes", logic.len());
        }
        meta.set(DEVICE_SECTION, "samplerate", samplerate_string(samplerate));
        meta.set(DEVICE_SECTION, "total analog", analog_names.len());
        for channel in logic.iter().filter(|c| c.enabled) {
            meta.set(
                DEVICE_SECTION,
                &format!("probe{}", channel.index + 1),
                &channel.name,
            );
        }
        for (position, name) in analog_names.iter().enumerate() {
            meta.set(
                DEVICE_SECTION,
                &format!("analog{}", first_analog_index + position),
                name,
            );
        }

        let mut zip = ZipWriter::new(File::create(&path)?);
        zip.start_file("version", entry_options())?;
        zip.write_all(SESSION_FORMAT_VERSION.to_string().as_bytes())?;
        zip.start_file("metadata", entry_options())?;
        zip.write_all(meta.to_string().as_bytes())?;
        zip.finish()?;

        log::debug!("Created session file {}", path.display());
        Ok(Self {
            path,
            config,
            analog_names,
            first_analog_index,
            unitsize_recorded: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append logic samples, `unitsize` bytes per sample.
    pub fn append(&mut self, data: &[u8], unitsize: usize) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if unitsize == 0 {
            return Err(SessionFileError::BadMetadata("unitsize must not be 0".to_string()));
        }
        if data.len() % unitsize != 0 {
            log::warn!(
                "Chunk size {} not a multiple of the unit size {unitsize}.",
                data.len()
            );
        }

        let chunk = (self.config.chunk_bytes / unitsize).max(1) * unitsize;
        for piece in data.chunks(chunk) {
            let metadata = if self.unitsize_recorded {
                None
            } else {
                Some(self.metadata_with_unitsize(unitsize)?)
            };
            self.append_entry(LOGIC_CAPTURE, piece, metadata.as_deref())?;
            self.unitsize_recorded = true;
        }
        Ok(())
    }

    /// Append samples of the `position`-th enabled analog channel.
    pub fn append_analog(&mut self, position: usize, samples: &[f32]) -> Result<()> {
        if position >= self.analog_names.len() {
            return Err(SessionFileError::BadMetadata(format!(
                "no enabled analog channel at position {position}"
            )));
        }
        if samples.is_empty() {
            return Ok(());
        }

        let base = format!("analog-1-{}", self.first_analog_index + position);
        let per_chunk = (self.config.chunk_bytes / 4).max(1);
        for piece in samples.chunks(per_chunk) {
            let bytes: Vec<u8> = piece.iter().flat_map(|v| v.to_le_bytes()).collect();
            self.append_entry(&base, &bytes, None)?;
        }
        Ok(())
    }

    /// Store the sample data of `packet`; other packets are ignored.
    ///
    /// Analog packets must cover exactly one enabled analog channel.
    pub fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        match packet {
            Packet::Logic(logic) => self.append(&logic.data, logic.unitsize),
            Packet::Analog(analog) => {
                let [name] = analog.meaning.channels.as_slice() else {
                    return Err(SessionFileError::UnsupportedPacket(format!(
                        "analog packet covers {} channels, expected exactly one",
                        analog.meaning.channels.len()
                    )));
                };
                let position = self
                    .analog_names
                    .iter()
                    .position(|n| n == name)
                    .ok_or_else(|| {
                        SessionFileError::UnsupportedPacket(format!(
                            "no enabled analog channel named '{name}'"
                        ))
                    })?;
                self.append_analog(position, &analog.data)
            }
            _ => Ok(()),
        }
    }

    fn metadata_with_unitsize(&self, unitsize: usize) -> Result<String> {
        let file = File::open(&self.path)?;
        let mut archive = ZipArchive::new(file)?;
        let text = String::from_utf8_lossy(&read_entry(&mut archive, "metadata")?).into_owned();
        let mut meta = KeyFile::parse(&text)?;
        if meta.get(DEVICE_SECTION, "unitsize").is_some() {
            return Ok(text);
        }
        meta.set(DEVICE_SECTION, "unitsize", unitsize);
        Ok(meta.to_string())
    }

    /// Add the next chunk of `base`. The first chunk is stored unsuffixed;
    /// adding a second one renames it to `<base>-1`.
    fn append_entry(&self, base: &str, data: &[u8], metadata: Option<&str>) -> Result<()> {
        let names = {
            let archive = ZipArchive::new(File::open(&self.path)?)?;
            entry_names(&archive)
        };

        let (rename, entry) = if names.contains(base) {
            (Some(base), format!("{base}-2"))
        } else {
            let last = capture_entries(&names, base).len();
            if last == 0 {
                (None, base.to_string())
            } else {
                (None, format!("{base}-{}", last + 1))
            }
        };

        if rename.is_none() && metadata.is_none() {
            let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
            let mut zip = ZipWriter::new_append(file)?;
            zip.start_file(entry.as_str(), entry_options())?;
            zip.write_all(data)?;
            zip.finish()?;
        } else {
            self.rebuild(rename, metadata, &entry, data)?;
        }
        log::trace!("Appended {} bytes as '{entry}'", data.len());
        Ok(())
    }

    /// Rewrite the whole archive, renaming `rename` to `<rename>-1` and
    /// replacing `metadata` if given, then add `entry`.
    fn rebuild(
        &self,
        rename: Option<&str>,
        metadata: Option<&str>,
        entry: &str,
        data: &[u8],
    ) -> Result<()> {
        let mut archive = ZipArchive::new(Cursor::new(std::fs::read(&self.path)?))?;
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

        for i in 0..archive.len() {
            let file = archive.by_index_raw(i)?;
            let name = file.name().to_string();
            if metadata.is_some() && name == "metadata" {
                continue;
            }
            if rename == Some(name.as_str()) {
                log::debug!("Renaming '{name}' to '{name}-1'");
                zip.raw_copy_file_rename(file, format!("{name}-1"))?;
            } else {
                zip.raw_copy_file(file)?;
            }
        }
        if let Some(metadata) = metadata {
            zip.start_file("metadata", entry_options())?;
            zip.write_all(metadata.as_bytes())?;
        }
        zip.start_file(entry, entry_options())?;
        zip.write_all(data)?;

        let bytes = zip.finish()?.into_inner();
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }
}

/// One `[device N]` section of a session's metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDevice {
    pub section: String,
    pub samplerate: u64,
    /// Bytes per logic sample; 0 for purely analog devices.
    pub unitsize: usize,
    pub total_probes: usize,
    pub capturefile: Option<String>,
    /// Logic channels first, then analog ones.
    pub channels: Vec<Channel>,
}

impl SessionDevice {
    pub fn logic_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(|c| c.kind == ChannelType::Logic)
    }

    pub fn analog_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(|c| c.kind == ChannelType::Analog)
    }

    fn from_section(meta: &KeyFile, section: &str) -> Result<Self> {
        let bad = |what: String| SessionFileError::BadMetadata(format!("[{section}] {what}"));

        let int = |key: &str| -> Result<Option<usize>> {
            meta.get(section, key)
                .map(|v| v.parse::<usize>().map_err(|_| bad(format!("invalid {key} '{v}'"))))
                .transpose()
        };

        let capturefile = meta.get(section, "capturefile").map(str::to_string);
        let total_probes = int("total probes")?.unwrap_or(0);
        let total_analog = int("total analog")?.unwrap_or(0);

        let samplerate = match meta.get(section, "samplerate") {
            Some(text) => parse_size(text).map_err(|e| bad(e.to_string()))?,
            None => 0,
        };

        let unitsize = match int("unitsize")? {
            Some(0) => return Err(bad("unitsize must not be 0".to_string())),
            Some(unitsize) => unitsize,
            None if capturefile.is_some() => {
                let unitsize = total_probes.div_ceil(8).max(1);
                log::debug!("No unitsize in [{section}], assuming {unitsize}");
                unitsize
            }
            None => 0,
        };

        let mut channels: Vec<Channel> = (0..total_probes)
            .map(|i| Channel::logic(i, &i.to_string()).disabled())
            .chain(
                (0..total_analog)
                    .map(|i| Channel::analog(i, &(total_probes + i).to_string()).disabled()),
            )
            .collect();

        for (key, value) in meta.entries(section) {
            let number = if let Some(n) = key.strip_prefix("probe") {
                n
            } else if let Some(n) = key.strip_prefix("analog") {
                n
            } else {
                continue;
            };
            let Ok(number) = number.parse::<usize>() else {
                continue;
            };
            let position = number
                .checked_sub(1)
                .filter(|&p| p < channels.len())
                .ok_or_else(|| bad(format!("{key} refers to a missing channel")))?;
            let expected = if key.starts_with("probe") {
                ChannelType::Logic
            } else {
                ChannelType::Analog
            };
            let channel = &mut channels[position];
            if channel.kind != expected {
                return Err(bad(format!("{key} refers to a {} channel", channel.kind.as_str())));
            }
            channel.name = value.to_string();
            channel.enabled = true;
        }

        Ok(Self {
            section: section.to_string(),
            samplerate,
            unitsize,
            total_probes,
            capturefile,
            channels,
        })
    }
}

/// What a replay published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub logic_samples: u64,
    pub analog_samples: u64,
}

/// Probe `path`: returns the format version if it is a readable session.
pub fn check(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let mut archive = ZipArchive::new(File::open(path)?)?;
    read_version(&mut archive)
}

fn read_version<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<u64> {
    let raw = read_entry(archive, "version").map_err(|e| match e {
        SessionFileError::MissingEntry(_) => {
            log::debug!("Not a session file: no version found.");
            SessionFileError::NotASession("no version entry".to_string())
        }
        other => other,
    })?;
    let text = String::from_utf8_lossy(&raw);
    let digits: String = text.trim().chars().take_while(char::is_ascii_digit).collect();
    let version = digits.parse::<u64>().unwrap_or(0);
    if version == 0 || version > SESSION_FORMAT_VERSION {
        log::debug!("Cannot handle session file version {version}.");
        return Err(SessionFileError::UnsupportedVersion(version));
    }
    log::trace!("Detected session file version {version}.");
    Ok(version)
}

/// A session archive opened for reading.
#[derive(Debug)]
pub struct SessionFile {
    archive: ZipArchive<File>,
    version: u64,
    devices: Vec<SessionDevice>,
    replay_chunk_bytes: usize,
}

impl SessionFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let _span = tracing::debug_span!("session_load", path = %path.display()).entered();

        let mut archive = ZipArchive::new(File::open(path)?)?;
        let version = read_version(&mut archive)?;

        let raw = read_entry(&mut archive, "metadata")?;
        let text = std::str::from_utf8(&raw)
            .map_err(|e| SessionFileError::BadMetadata(format!("metadata is not UTF-8: {e}")))?;
        let meta = KeyFile::parse(text)?;

        let devices = meta
            .section_names()
            .filter(|name| name.starts_with("device "))
            .map(|name| SessionDevice::from_section(&meta, name))
            .collect::<Result<Vec<_>>>()?;
        log::debug!(
            "Loaded session {} (version {version}, {} device(s))",
            path.display(),
            devices.len()
        );

        Ok(Self {
            archive,
            version,
            devices,
            replay_chunk_bytes: CHUNK_SIZE,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn devices(&self) -> &[SessionDevice] {
        &self.devices
    }

    /// Largest payload of one replayed packet.
    pub fn replay_chunk_bytes(mut self, bytes: usize) -> Self {
        self.replay_chunk_bytes = bytes.max(1);
        self
    }

    /// Publish the whole capture on `bus`: a header, then per device its
    /// samplerate, logic chunks and analog channels, then the end marker.
    pub fn replay(&mut self, bus: &mut DatafeedBus) -> Result<ReplaySummary> {
        let _span = tracing::debug_span!("session_replay").entered();
        let names = entry_names(&self.archive);
        let mut summary = ReplaySummary::default();

        bus.publish(Packet::header())?;

        for device in &self.devices {
            if device.samplerate > 0 {
                bus.publish(Packet::Meta(vec![MetaItem::Samplerate(device.samplerate)]))?;
            }

            if let Some(base) = &device.capturefile {
                let entries = capture_entries(&names, base);
                if entries.is_empty() {
                    log::error!("No capture file '{base}' in session file.");
                    return Err(SessionFileError::MissingEntry(base.clone()));
                }
                let unitsize = device.unitsize;
                let piece = (self.replay_chunk_bytes / unitsize).max(1) * unitsize;
                for entry in entries {
                    log::debug!("Opened {entry}.");
                    let data = read_entry(&mut self.archive, &entry)?;
                    if data.len() % unitsize != 0 {
                        log::warn!(
                            "Read size {} not a multiple of the unit size {unitsize}.",
                            data.len()
                        );
                    }
                    for part in data.chunks(piece) {
                        summary.logic_samples += (part.len() / unitsize) as u64;
                        bus.publish(Packet::Logic(Logic::new(unitsize, part.to_vec())))?;
                    }
                }
            }

            for channel in device.analog_channels() {
                let base = format!("analog-1-{}", device.total_probes + channel.index + 1);
                let per_packet = (self.replay_chunk_bytes / 4).max(1) * 4;
                for entry in capture_entries(&names, &base) {
                    log::debug!("Opened {entry}.");
                    let data = read_entry(&mut self.archive, &entry)?;
                    for part in data.chunks(per_packet) {
                        let samples: Vec<f32> = part
                            .chunks_exact(4)
                            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                            .collect();
                        summary.analog_samples += samples.len() as u64;
                        bus.publish(Packet::Analog(Analog {
                            meaning: AnalogMeaning::new(
                                Quantity::Voltage,
                                Unit::Volt,
                                MqFlags::DC,
                                &channel.name,
                            ),
                            digits: 2,
                            data: samples,
                        }))?;
                    }
                }
            }
        }

        bus.publish(Packet::End)?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recording_bus() -> (DatafeedBus, Rc<RefCell<Vec<Packet>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let mut bus = DatafeedBus::new();
        bus.add_callback(move |packet: &Packet| sink.borrow_mut().push(packet.clone()));
        (bus, seen)
    }

    fn channels() -> Vec<Channel> {
        vec![
            Channel::logic(0, "D0"),
            Channel::logic(1, "D1").disabled(),
            Channel::logic(2, "CLK"),
            Channel::analog(0, "VBUS"),
        ]
    }

    fn write_raw_session(path: &Path, entries: &[(&str, &[u8])]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for (name, data) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn archive_names(path: &Path) -> HashSet<String> {
        entry_names(&ZipArchive::new(File::open(path).unwrap()).unwrap())
    }

    fn analog_packet(channels: &[&str], data: Vec<f32>) -> Packet {
        let mut meaning = AnalogMeaning::new(Quantity::Voltage, Unit::Volt, MqFlags::DC, "");
        meaning.channels = channels.iter().map(|c| c.to_string()).collect();
        Packet::Analog(Analog {
            meaning,
            digits: 2,
            data,
        })
    }

    #[test]
    fn test_analog_packets_need_one_known_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analog.sr");
        let channels = [Channel::analog(0, "V1"), Channel::analog(1, "V2")];
        let mut writer =
            SessionWriter::save_init(&path, &channels, 1_000, SessionWriterConfig::default())
                .unwrap();

        assert!(matches!(
            writer.write_packet(&analog_packet(&["V1", "V2"], vec![1.0, 2.0])),
            Err(SessionFileError::UnsupportedPacket(_))
        ));
        assert!(matches!(
            writer.write_packet(&analog_packet(&["V3"], vec![1.0])),
            Err(SessionFileError::UnsupportedPacket(_))
        ));
        assert!(matches!(
            writer.write_packet(&analog_packet(&[], vec![1.0])),
            Err(SessionFileError::UnsupportedPacket(_))
        ));
        writer
            .write_packet(&analog_packet(&["V2"], vec![1.0, 2.0]))
            .unwrap();

        let mut session = SessionFile::open(&path).unwrap();
        let (mut bus, seen) = recording_bus();
        let summary = session.replay(&mut bus).unwrap();
        assert_eq!(summary.analog_samples, 2);

        let stored: Vec<(Vec<String>, Vec<f32>)> = seen
            .borrow()
            .iter()
            .filter_map(|packet| match packet {
                Packet::Analog(a) => Some((a.meaning.channels.clone(), a.data.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(stored, vec![(vec!["V2".to_string()], vec![1.0, 2.0])]);
    }

    #[test]
    fn test_single_append_stays_unchunked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("one.sr");
        let mut writer =
            SessionWriter::save_init(&path, &channels(), 1_000_000, SessionWriterConfig::default())
                .unwrap();
        writer.append(&[1, 2, 3], 1).unwrap();

        let names = archive_names(&path);
        assert!(names.contains("logic-1"));
        assert!(!names.contains("logic-1-1"));
        assert_eq!(check(&path).unwrap(), SESSION_FORMAT_VERSION);
    }

    #[test]
    fn test_second_append_renames_first_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunks.sr");
        let mut writer =
            SessionWriter::save_init(&path, &channels(), 1_000_000, SessionWriterConfig::default())
                .unwrap();
        writer.append(&[1, 2, 3], 1).unwrap();
        writer.append(&[4, 5], 1).unwrap();
        writer.append(&[6], 1).unwrap();

        let names = archive_names(&path);
        assert!(!names.contains("logic-1"));
        for name in ["logic-1-1", "logic-1-2", "logic-1-3", "version", "metadata"] {
            assert!(names.contains(name), "missing {name}");
        }
    }

    #[test]
    fn test_round_trip_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trip.sr");
        let mut writer =
            SessionWriter::save_init(&path, &channels(), 31_500, SessionWriterConfig::default())
                .unwrap();
        writer.append(&[1, 2, 3], 1).unwrap();
        writer.append(&[4, 5], 1).unwrap();
        writer.append_analog(0, &[0.5, -1.25]).unwrap();

        let mut session = SessionFile::open(&path).unwrap().replay_chunk_bytes(2);
        let device = &session.devices()[0];
        assert_eq!(device.samplerate, 31_500);
        assert_eq!(device.unitsize, 1);
        assert_eq!(device.total_probes, 3);
        let names: Vec<_> = device
            .channels
            .iter()
            .map(|c| (c.name.as_str(), c.enabled))
            .collect();
        assert_eq!(
            names,
            vec![("D0", true), ("1", false), ("CLK", true), ("VBUS", true)]
        );

        let (mut bus, seen) = recording_bus();
        let summary = session.replay(&mut bus).unwrap();
        assert_eq!(
            summary,
            ReplaySummary {
                logic_samples: 5,
                analog_samples: 2
            }
        );

        let seen = seen.borrow();
        let kinds: Vec<_> = seen.iter().map(Packet::kind_name).collect();
        assert_eq!(
            kinds,
            vec!["HEADER", "META", "LOGIC", "LOGIC", "LOGIC", "ANALOG", "ANALOG", "END"]
        );
        assert_eq!(seen[1], Packet::Meta(vec![MetaItem::Samplerate(31_500)]));
        assert_eq!(seen[2], Packet::Logic(Logic::new(1, vec![1, 2])));
        assert_eq!(seen[3], Packet::Logic(Logic::new(1, vec![3])));
        assert_eq!(seen[4], Packet::Logic(Logic::new(1, vec![4, 5])));
        let Packet::Analog(analog) = &seen[5] else {
            unreachable!("expected analog packet");
        };
        assert_eq!(analog.data, vec![0.5]);
        assert_eq!(analog.meaning.channels, vec!["VBUS".to_string()]);
    }

    #[test]
    fn test_writer_splits_large_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("split.sr");
        let config = SessionWriterConfig::default().chunk_bytes(5);
        let mut writer = SessionWriter::save_init(&path, &channels(), 1_000, config).unwrap();
        // Pieces are cut at whole samples: 4 + 4 + 2 bytes.
        writer.append(&[0; 10], 2).unwrap();

        let names = archive_names(&path);
        for name in ["logic-1-1", "logic-1-2", "logic-1-3"] {
            assert!(names.contains(name), "missing {name}");
        }
    }

    #[test]
    fn test_missing_unitsize_defaults_from_probe_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.sr");
        let metadata = "[global]\nsigrok version=0.2.0\n\n[device 1]\ncapturefile=logic-1\n\
                        total probes=10\nsamplerate=1 kHz\nprobe1=A\nprobe10=B\n";
        write_raw_session(
            &path,
            &[
                ("version", b"1".as_slice()),
                ("metadata", metadata.as_bytes()),
                ("logic-1", [1u8, 0, 2, 0].as_slice()),
            ],
        );

        let mut session = SessionFile::open(&path).unwrap();
        assert_eq!(session.version(), 1);
        assert_eq!(session.devices()[0].unitsize, 2);

        let (mut bus, seen) = recording_bus();
        session.replay(&mut bus).unwrap();
        assert_eq!(seen.borrow()[2], Packet::Logic(Logic::new(2, vec![1, 0, 2, 0])));
    }

    #[test]
    fn test_version_checks() {
        let dir = tempfile::tempdir().unwrap();

        let future = dir.path().join("future.sr");
        write_raw_session(&future, &[("version", b"3".as_slice()), ("metadata", b"".as_slice())]);
        assert!(matches!(
            check(&future),
            Err(SessionFileError::UnsupportedVersion(3))
        ));

        let plain = dir.path().join("plain.zip");
        write_raw_session(&plain, &[("readme.txt", b"hello".as_slice())]);
        assert!(matches!(check(&plain), Err(SessionFileError::NotASession(_))));

        let garbage = dir.path().join("garbage.sr");
        std::fs::write(&garbage, b"not a zip".as_slice()).unwrap();
        assert!(matches!(check(&garbage), Err(SessionFileError::Zip(_))));
    }

    #[test]
    fn test_bad_metadata_is_fatal() {
        let dir = tempfile::tempdir().unwrap();

        let no_meta = dir.path().join("nometa.sr");
        write_raw_session(&no_meta, &[("version", b"2".as_slice())]);
        assert!(matches!(
            SessionFile::open(&no_meta),
            Err(SessionFileError::MissingEntry(_))
        ));

        let bad_probe = dir.path().join("badprobe.sr");
        write_raw_session(
            &bad_probe,
            &[
                ("version", b"2".as_slice()),
                ("metadata", b"[device 1]\ntotal probes=2\nprobe5=X\n".as_slice()),
            ],
        );
        assert!(matches!(
            SessionFile::open(&bad_probe),
            Err(SessionFileError::BadMetadata(_))
        ));

        let bad_rate = dir.path().join("badrate.sr");
        write_raw_session(
            &bad_rate,
            &[("version", b"2".as_slice()), ("metadata", b"[device 1]\nsamplerate=fast\n".as_slice())],
        );
        assert!(matches!(
            SessionFile::open(&bad_rate),
            Err(SessionFileError::BadMetadata(_))
        ));
    }

    #[test]
    fn test_missing_capture_data_fails_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.sr");
        write_raw_session(
            &path,
            &[
                ("version", b"2".as_slice()),
                ("metadata", b"[device 1]\ncapturefile=logic-1\ntotal probes=1\n".as_slice()),
            ],
        );
        let mut session = SessionFile::open(&path).unwrap();
        let (mut bus, _) = recording_bus();
        assert!(matches!(
            session.replay(&mut bus),
            Err(SessionFileError::MissingEntry(_))
        ));
    }
}
