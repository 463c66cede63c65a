//! Receiver-side recording
//!
//! Rolling WAV segments of the received PCM plus a per-packet CSV log of
//! sequence classification, arrival timing and waveform continuity.
//!
//! ```text
//! WAV layout (little-endian, 44-byte header):
//! ┌──────┬──────┬──────┬──────────────────────────┬──────┬──────┬─────────┐
//! │ RIFF │ size │ WAVE │ fmt  16 PCM ch rate ...  │ data │ len  │ s16le … │
//! └──────┴──────┴──────┴──────────────────────────┴──────┴──────┴─────────┘
//! ```

use bytes::{BufMut, BytesMut};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::codec::decoder::SequenceClass;
use crate::protocol::SessionHeader;

const WAV_HEADER_LEN: usize = 44;
const SEGMENT_PREFIX: &str = "segment_";
const SEGMENT_SUFFIX: &str = ".wav";

/// Rows between explicit flushes of the packet log
const LOG_FLUSH_ROWS: u64 = 100;

/// Sample discontinuity between consecutive packets worth a warning
pub const EDGE_JUMP_THRESHOLD: u32 = 1500;

pub const PACKET_LOG_COLUMNS: &str =
    "time_s,seq,expected,gap,event,lost_total,dup_total,reorder_total,delta_ms,mean,edge_jump";

/// Layout of the PCM being recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl PcmFormat {
    pub fn block_align(&self) -> u16 {
        self.channels * (self.bits_per_sample / 8)
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * u32::from(self.block_align())
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: 8_000,
            channels: 1,
            bits_per_sample: 16,
        }
    }
}

impl From<&SessionHeader> for PcmFormat {
    fn from(header: &SessionHeader) -> Self {
        Self {
            sample_rate: header.sample_rate,
            channels: u16::from(header.channels),
            bits_per_sample: u16::from(header.bits_per_sample),
        }
    }
}

/// Write `pcm` as a complete WAV file
pub fn write_wav<W: Write>(out: &mut W, format: PcmFormat, pcm: &[u8]) -> io::Result<()> {
    let data_len = u32::try_from(pcm.len())
        .ok()
        .filter(|len| *len <= u32::MAX - 36)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "PCM too large for a WAV file"))?;

    let mut header = BytesMut::with_capacity(WAV_HEADER_LEN);
    header.put_slice(b"RIFF");
    header.put_u32_le(36 + data_len);
    header.put_slice(b"WAVE");

    header.put_slice(b"fmt ");
    header.put_u32_le(16);
    header.put_u16_le(1); // integer PCM
    header.put_u16_le(format.channels);
    header.put_u32_le(format.sample_rate);
    header.put_u32_le(format.byte_rate());
    header.put_u16_le(format.block_align());
    header.put_u16_le(format.bits_per_sample);

    header.put_slice(b"data");
    header.put_u32_le(data_len);

    out.write_all(&header)?;
    out.write_all(pcm)
}

/// Splits the received audio into fixed-length WAV files
pub struct SegmentRecorder {
    dir: PathBuf,
    period: Duration,
    format: PcmFormat,
    pcm: Vec<u8>,
    started: Instant,
    started_wall: SystemTime,
    saved: u64,
}

impl SegmentRecorder {
    pub fn new(dir: impl Into<PathBuf>, period: Duration, now: Instant) -> Self {
        Self {
            dir: dir.into(),
            period,
            format: PcmFormat::default(),
            pcm: Vec::new(),
            started: now,
            started_wall: SystemTime::now(),
            saved: 0,
        }
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Change the recorded format. Audio buffered in the old format is saved
    /// first so no file mixes two rates.
    pub fn set_format(&mut self, format: PcmFormat, now: Instant) -> io::Result<Option<PathBuf>> {
        if format == self.format {
            return Ok(None);
        }
        let saved = self.flush(now);
        self.format = format;
        saved
    }

    /// Append a payload. Returns the saved file once the segment spans the
    /// configured period.
    pub fn push(&mut self, payload: &[u8], now: Instant) -> io::Result<Option<PathBuf>> {
        self.pcm.extend_from_slice(payload);
        if now.saturating_duration_since(self.started) >= self.period {
            self.flush(now)
        } else {
            Ok(None)
        }
    }

    /// Save whatever is buffered and begin a new segment. Buffered audio is
    /// discarded even when the write fails.
    pub fn flush(&mut self, now: Instant) -> io::Result<Option<PathBuf>> {
        let result = if self.pcm.is_empty() {
            Ok(None)
        } else {
            let path = self.dir.join(segment_name(self.started_wall, self.saved));
            self.save(&path).map(|()| Some(path))
        };

        self.pcm.clear();
        self.started = now;
        self.started_wall = SystemTime::now();
        if matches!(result, Ok(Some(_))) {
            self.saved += 1;
        }
        result
    }

    fn save(&self, path: &Path) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        write_wav(&mut out, self.format, &self.pcm)?;
        out.flush()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.pcm.len()
    }

    /// Segments written so far
    pub fn saved(&self) -> u64 {
        self.saved
    }
}

fn segment_name(started: SystemTime, index: u64) -> String {
    let secs = started
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("{}{}_{:04}{}", SEGMENT_PREFIX, secs, index, SEGMENT_SUFFIX)
}

/// Delete segment files left over from a previous run. Other files in the
/// directory are untouched.
pub fn remove_segments(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_segment = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(SEGMENT_PREFIX) && name.ends_with(SEGMENT_SUFFIX));
        if is_segment && path.is_file() {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Waveform summary of one packet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameShape {
    pub mean: i32,
    /// |first sample − last sample of the previous packet|
    pub edge_jump: u32,
}

/// Tracks sample continuity across packet boundaries (s16le mono)
#[derive(Debug, Default)]
pub struct EdgeTracker {
    prev_last: Option<i16>,
}

impl EdgeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, payload: &[u8]) -> FrameShape {
        let mut samples = payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]));

        let Some(first) = samples.next() else {
            return FrameShape::default();
        };
        let (mut sum, mut count, mut last) = (i64::from(first), 1i64, first);
        for sample in samples {
            sum += i64::from(sample);
            count += 1;
            last = sample;
        }

        let edge_jump = self
            .prev_last
            .map_or(0, |prev| (i32::from(first) - i32::from(prev)).unsigned_abs());
        self.prev_last = Some(last);

        FrameShape {
            mean: (sum / count) as i32,
            edge_jump,
        }
    }

    pub fn reset(&mut self) {
        self.prev_last = None;
    }
}

/// One row of the packet log
#[derive(Debug, Clone)]
pub struct PacketRecord {
    /// Time since the receiver started
    pub time: Duration,
    pub sequence: u32,
    pub expected: u32,
    pub class: SequenceClass,
    pub lost_total: u64,
    pub dup_total: u64,
    pub reorder_total: u64,
    /// Time since the previous packet arrived
    pub delta: Duration,
    pub shape: FrameShape,
}

/// CSV log with one row per received packet
pub struct PacketLog<W: Write> {
    out: W,
    rows: u64,
}

impl PacketLog<BufWriter<File>> {
    pub fn create(path: &Path) -> io::Result<Self> {
        Self::new(BufWriter::new(File::create(path)?))
    }
}

impl<W: Write> PacketLog<W> {
    pub fn new(mut out: W) -> io::Result<Self> {
        writeln!(out, "{}", PACKET_LOG_COLUMNS)?;
        Ok(Self { out, rows: 0 })
    }

    pub fn record(&mut self, row: &PacketRecord) -> io::Result<()> {
        let gap = match row.class {
            SequenceClass::Gap(gap) => gap,
            _ => 0,
        };
        writeln!(
            self.out,
            "{:.6},{},{},{},{},{},{},{},{:.3},{},{}",
            row.time.as_secs_f64(),
            row.sequence,
            row.expected,
            gap,
            row.class.label(),
            row.lost_total,
            row.dup_total,
            row.reorder_total,
            row.delta.as_secs_f64() * 1000.0,
            row.shape.mean,
            row.shape.edge_jump,
        )?;

        self.rows += 1;
        if self.rows % LOG_FLUSH_ROWS == 0 {
            self.out.flush()?;
        }
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CodecTag;

    fn u16_at(data: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([data[at], data[at + 1]])
    }

    fn u32_at(data: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
    }

    #[test]
    fn test_wav_header_layout() {
        let format = PcmFormat::from(&SessionHeader::for_codec(CodecTag::Wideband, 1, 16));
        let mut out = Vec::new();
        write_wav(&mut out, format, &[0u8; 480]).unwrap();

        assert_eq!(out.len(), WAV_HEADER_LEN + 480);
        assert_eq!(&out[0..4], b"RIFF");
        assert_eq!(u32_at(&out, 4), 36 + 480);
        assert_eq!(&out[8..16], b"WAVEfmt ");
        assert_eq!(u16_at(&out, 20), 1);
        assert_eq!(u16_at(&out, 22), 1);
        assert_eq!(u32_at(&out, 24), 16_000);
        assert_eq!(u32_at(&out, 28), 32_000);
        assert_eq!(u16_at(&out, 32), 2);
        assert_eq!(u16_at(&out, 34), 16);
        assert_eq!(&out[36..40], b"data");
        assert_eq!(u32_at(&out, 40), 480);
    }

    #[test]
    fn test_segments_roll_after_period() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = Instant::now();
        let mut recorder = SegmentRecorder::new(dir.path(), Duration::from_secs(5), t0);

        assert!(recorder.push(&[1; 120], t0).unwrap().is_none());
        assert!(recorder.push(&[2; 120], t0 + Duration::from_secs(2)).unwrap().is_none());
        let path = recorder
            .push(&[3; 120], t0 + Duration::from_secs(5))
            .unwrap()
            .expect("segment saved at the period boundary");

        let data = fs::read(&path).unwrap();
        assert_eq!(data.len(), WAV_HEADER_LEN + 360);
        assert_eq!(u32_at(&data, 24), 8_000);
        assert_eq!(&data[WAV_HEADER_LEN..WAV_HEADER_LEN + 120], &[1; 120][..]);
        assert_eq!(recorder.buffered_bytes(), 0);
        assert_eq!(recorder.saved(), 1);

        // The next segment is timed from the save
        assert!(recorder.push(&[4; 120], t0 + Duration::from_secs(9)).unwrap().is_none());
    }

    #[test]
    fn test_format_change_saves_pending_audio() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = Instant::now();
        let mut recorder = SegmentRecorder::new(dir.path(), Duration::from_secs(5), t0);
        recorder.push(&[0; 120], t0).unwrap();

        let wideband = PcmFormat {
            sample_rate: 16_000,
            ..PcmFormat::default()
        };
        let path = recorder.set_format(wideband, t0).unwrap().unwrap();
        assert_eq!(u32_at(&fs::read(&path).unwrap(), 24), 8_000);
        assert_eq!(recorder.format(), wideband);

        // Same format again is a no-op
        assert!(recorder.set_format(wideband, t0).unwrap().is_none());
        // Nothing buffered, nothing written
        assert!(recorder.flush(t0).unwrap().is_none());
        assert_eq!(recorder.saved(), 1);
    }

    #[test]
    fn test_remove_segments_only_touches_segments() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("segment_1_0000.wav"), b"x").unwrap();
        fs::write(dir.path().join("segment_2_0001.wav"), b"x").unwrap();
        fs::write(dir.path().join("packet_log.csv"), b"x").unwrap();

        assert_eq!(remove_segments(dir.path()).unwrap(), 2);
        assert!(dir.path().join("packet_log.csv").exists());
        assert_eq!(remove_segments(dir.path()).unwrap(), 0);
    }

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_edge_tracker() {
        let mut edges = EdgeTracker::new();
        assert_eq!(
            edges.observe(&pcm(&[100, -300, 50])),
            FrameShape {
                mean: -50,
                edge_jump: 0
            }
        );
        assert_eq!(edges.observe(&pcm(&[2_050, 2_050])).edge_jump, 2_000);
        // Too short to hold a sample: no stats, continuity kept
        assert_eq!(edges.observe(&[7]), FrameShape::default());
        assert_eq!(edges.observe(&pcm(&[2_040])).edge_jump, 10);

        edges.reset();
        assert_eq!(edges.observe(&pcm(&[i16::MIN])).edge_jump, 0);
    }

    #[test]
    fn test_packet_log_rows() {
        let mut out = Vec::new();
        {
            let mut log = PacketLog::new(&mut out).unwrap();
            log.record(&PacketRecord {
                time: Duration::from_millis(500),
                sequence: 7,
                expected: 5,
                class: SequenceClass::Gap(2),
                lost_total: 2,
                dup_total: 0,
                reorder_total: 1,
                delta: Duration::from_micros(7_500),
                shape: FrameShape {
                    mean: -3,
                    edge_jump: 12,
                },
            })
            .unwrap();
            log.flush().unwrap();
            assert_eq!(log.rows(), 1);
        }

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], PACKET_LOG_COLUMNS);
        assert_eq!(lines[1], "0.500000,7,5,2,GAP,2,0,1,7.500,-3,12");
    }
}
