//! Differential hex dump: 16-byte lines with run suppression.
//!
//! A line identical to its predecessor is still printed once, so a single
//! repeat is visible.  Further repeats are swallowed and replaced by one `*`
//! when the run ends.  While inside a run the encoder skips whole 16-byte
//! strides that equal the retained line without touching them byte by byte,
//! which keeps dumping an erased (all-zero or all-0xff) device cheap.
//!
//! Line format:
//!
//! ```text
//! 0000000000000200  5b4449534b555320 3030303030303030  |[DISKUS 00000000|
//! ```

use std::io::{self, Write};

pub const LINE_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineState {
    /// No previous line to compare against.
    Fresh,
    /// Last line was printed; the next repeat is printed too.
    SeenOnce,
    /// Repeats are being suppressed.
    Run,
}

#[derive(Debug, Clone)]
pub struct DiffHexEncoder {
    line:       [u8; LINE_LEN],
    fill:       usize,
    dirty:      bool,
    state:      LineState,
    suppressed: u64,
    position:   u64,
    expand:     bool,
}

impl DiffHexEncoder {
    /// New encoder whose first byte sits at absolute offset `position`.
    /// With `expand` every line is printed.
    pub fn new(position: u64, expand: bool) -> Self {
        Self {
            line: [0u8; LINE_LEN],
            fill: 0,
            dirty: false,
            state: LineState::Fresh,
            suppressed: 0,
            position,
            expand,
        }
    }

    /// Absolute offset of the next byte to be encoded.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Flush everything pending and continue at a new offset with no
    /// retained line (used after a discontinuity in the input).
    pub fn restart(&mut self, position: u64, out: &mut dyn Write) -> io::Result<()> {
        self.finish(out)?;
        self.position = position;
        Ok(())
    }

    pub fn encode(&mut self, data: &[u8], out: &mut dyn Write) -> io::Result<()> {
        let mut i = 0;
        while i < data.len() {
            if self.state == LineState::Run && self.fill == 0 && !self.expand {
                while i + LINE_LEN <= data.len() && data[i..i + LINE_LEN] == self.line {
                    i               += LINE_LEN;
                    self.position   += LINE_LEN as u64;
                    self.suppressed += 1;
                }
                if i >= data.len() {
                    break;
                }
            }

            let c = data[i];
            if self.line[self.fill] != c {
                self.line[self.fill] = c;
                self.dirty = true;
            }
            i += 1;
            self.position += 1;
            self.fill += 1;
            if self.fill < LINE_LEN {
                continue;
            }

            self.fill = 0;
            let start = self.position - LINE_LEN as u64;
            let dirty = std::mem::take(&mut self.dirty);
            if self.expand || dirty || self.state == LineState::Fresh {
                self.flush_run(out)?;
                write_line(out, start, &self.line)?;
                self.state = LineState::SeenOnce;
            } else if self.state == LineState::SeenOnce {
                write_line(out, start, &self.line)?;
                self.state = LineState::Run;
            } else {
                self.suppressed += 1;
            }
        }
        Ok(())
    }

    /// Print the pending run marker and any trailing partial line.
    pub fn finish(&mut self, out: &mut dyn Write) -> io::Result<()> {
        self.flush_run(out)?;
        if self.fill > 0 {
            let start = self.position - self.fill as u64;
            write_line(out, start, &self.line[..self.fill])?;
            self.fill = 0;
        }
        self.dirty = false;
        self.state = LineState::Fresh;
        Ok(())
    }

    fn flush_run(&mut self, out: &mut dyn Write) -> io::Result<()> {
        if self.suppressed > 0 {
            writeln!(out, "*")?;
            self.suppressed = 0;
        }
        Ok(())
    }
}

/// Dump `data` in one go.
pub fn dump(position: u64, data: &[u8], expand: bool, out: &mut dyn Write) -> io::Result<()> {
    let mut enc = DiffHexEncoder::new(position, expand);
    enc.encode(data, out)?;
    enc.finish(out)
}

fn write_line(out: &mut dyn Write, offset: u64, bytes: &[u8]) -> io::Result<()> {
    let hex = hex::encode(bytes);
    let (lo, hi) = hex.split_at(hex.len().min(LINE_LEN));
    let ascii: String = bytes
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect();
    writeln!(out, "{offset:016x}  {lo:<16} {hi:<16}  |{ascii}|")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(data: &[u8], expand: bool) -> Vec<String> {
        let mut out = Vec::new();
        dump(0, data, expand, &mut out).unwrap();
        String::from_utf8(out).unwrap().lines().map(str::to_owned).collect()
    }

    #[test]
    fn identical_lines_collapse_to_two_and_marker() {
        let data = vec![0xa5u8; 200 * LINE_LEN];
        let lines = run(&data, false);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("0000000000000000  a5a5"));
        assert!(lines[1].starts_with("0000000000000010  a5a5"));
        assert_eq!(lines[2], "*");
    }

    #[test]
    fn expand_prints_every_line() {
        let data = vec![0u8; 200 * LINE_LEN];
        let lines = run(&data, true);
        assert_eq!(lines.len(), 200);
        assert!(lines.iter().all(|l| l != "*"));
        assert!(lines[199].starts_with(&format!("{:016x}", 199 * LINE_LEN)));
    }

    #[test]
    fn run_marker_precedes_next_distinct_line() {
        let mut data = vec![0u8; 5 * LINE_LEN];
        data.extend_from_slice(b"0123456789abcdef");
        let lines = run(&data, false);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], "*");
        assert!(lines[3].starts_with("0000000000000050"));
        assert!(lines[3].ends_with("|0123456789abcdef|"));
    }

    #[test]
    fn single_repeat_has_no_marker() {
        let data = vec![7u8; 2 * LINE_LEN];
        let lines = run(&data, false);
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn state_carries_across_encode_calls() {
        let mut out = Vec::new();
        let mut enc = DiffHexEncoder::new(0x1000, false);
        for _ in 0..10 {
            enc.encode(&[0u8; 100], &mut out).unwrap();
        }
        enc.finish(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        // 1000 bytes: 62 full lines + 8-byte tail.
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], "*");
        assert!(lines[3].starts_with(&format!("{:016x}", 0x1000 + 62 * LINE_LEN)));
        assert_eq!(enc.position(), 0x1000 + 1000);
    }

    #[test]
    fn partial_line_is_padded() {
        let lines = run(b"abc", false);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("|abc|"));
        assert!(lines[0].contains("616263"));
    }

    #[test]
    fn restart_resets_retained_line() {
        let mut out = Vec::new();
        let mut enc = DiffHexEncoder::new(0, false);
        enc.encode(&[0u8; 64], &mut out).unwrap();
        enc.restart(4096, &mut out).unwrap();
        enc.encode(&[0u8; 16], &mut out).unwrap();
        enc.finish(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], "*");
        assert!(lines[3].starts_with("0000000000001000"));
    }
}
