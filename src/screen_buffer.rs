use tracing::warn;

/// States of the restricted ANSI/VT escape parser. Only `less`'s actual
/// escape vocabulary is understood; anything else is logged and
/// discarded without upsetting the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscMode {
    None,
    Esc,
    Csi,
    Osc,
}

#[derive(Debug, Clone)]
struct PendingAnchor {
    pattern: Vec<u8>,
    matched: usize,
}

/// A fixed `cols x rows` virtual terminal fed the raw byte stream of a
/// remote `less` session. Tracks cursor position, per-row wrap state,
/// and a set of byte-sequence anchors used to detect command
/// completion.
pub struct ScreenBuffer {
    cols: usize,
    rows: usize,
    posx: usize,
    posy: usize,
    rows_buf: Vec<Vec<u8>>,
    wrap: Vec<bool>,
    esc_mode: EscMode,
    esc_buf: String,
    anchors: Vec<PendingAnchor>,
    last_anchor: Option<Vec<u8>>,
    line_counter: u64,
    skip_prompt: bool,
}

impl ScreenBuffer {
    pub fn new(cols: usize, rows: usize) -> Self {
        ScreenBuffer {
            cols,
            rows,
            posx: 1,
            posy: 1,
            rows_buf: (0..rows).map(|_| Vec::new()).collect(),
            wrap: vec![false; rows],
            esc_mode: EscMode::None,
            esc_buf: String::new(),
            anchors: Vec::new(),
            last_anchor: None,
            line_counter: 0,
            skip_prompt: false,
        }
    }

    pub fn posx(&self) -> usize {
        self.posx
    }

    pub fn posy(&self) -> usize {
        self.posy
    }

    pub fn line_counter(&self) -> u64 {
        self.line_counter
    }

    pub fn reset_line_counter(&mut self) {
        self.line_counter = 0;
    }

    pub fn last_anchor(&self) -> Option<&[u8]> {
        self.last_anchor.as_deref()
    }

    pub fn set_skip_prompt(&mut self) {
        self.skip_prompt = true;
    }

    /// Registers a set of byte patterns as the completion anchors for
    /// the command about to be issued. `patterns` must not be empty;
    /// individual empty patterns inside it are dropped (they exist
    /// only as index placeholders in the task catalog).
    pub fn wait_new_anchor(&mut self, patterns: &[&[u8]]) {
        assert!(!patterns.is_empty(), "wait_new_anchor requires at least one pattern");
        for p in patterns {
            if !p.is_empty() {
                self.anchors.push(PendingAnchor { pattern: p.to_vec(), matched: 0 });
            }
        }
    }

    pub fn anchor_found(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn current_line(&self) -> String {
        String::from_utf8_lossy(&self.rows_buf[self.posy - 1]).into_owned()
    }

    /// Renders the grid, excluding the bottom row (which `less` uses
    /// for its status/prompt line).
    pub fn render(&self) -> String {
        let mut out = String::new();
        for row in 0..self.rows - 1 {
            out.push_str(&String::from_utf8_lossy(&self.rows_buf[row]));
            if !self.wrap[row] {
                out.push('\n');
            }
        }
        out
    }

    /// Feeds a chunk of raw bytes from the pty into the buffer,
    /// advancing anchor matching on every byte and, unless
    /// `anchor_only`, writing the byte into the grid as well. Stops
    /// early the moment an anchor completes.
    pub fn put_data(&mut self, buf: &[u8], anchor_only: bool) {
        for &ch in buf.iter() {
            let mut updated = Vec::with_capacity(self.anchors.len());
            let mut found = false;

            for anchor in &self.anchors {
                let mut pos = anchor.matched;
                if ch == anchor.pattern[pos] {
                    pos += 1;
                    if pos == anchor.pattern.len() {
                        if self.skip_prompt {
                            self.skip_prompt = false;
                            pos = 0;
                        } else {
                            self.last_anchor = Some(anchor.pattern.clone());
                            found = true;
                            break;
                        }
                    }
                } else {
                    pos = 0;
                }
                updated.push(PendingAnchor { pattern: anchor.pattern.clone(), matched: pos });
            }

            if !anchor_only {
                self.put_char(ch);
            }

            if found {
                self.anchors.clear();
                self.esc_mode = EscMode::None;
                break;
            }
            self.anchors = updated;
        }
    }

    fn put_char(&mut self, ch: u8) {
        if self.esc_pinball(ch) {
            return;
        }

        match ch {
            0x08 => {
                // backspace truncates the row from the new cursor
                // column onward rather than deleting a single cell
                if self.posx == 1 {
                    warn!("backspace at column 1");
                } else {
                    self.posx -= 1;
                    let pos = self.posx;
                    self.trunc_end_line(pos);
                }
            }
            b'\r' => self.posx = 1,
            b'\n' => self.new_line(false, false),
            _ => {
                if self.posx > self.cols {
                    self.posx = 2;
                    self.new_line(false, true);
                } else {
                    self.posx += 1;
                }
                self.rows_buf[self.posy - 1].push(ch);
            }
        }
    }

    /// Returns true if `ch` was consumed by the escape parser.
    fn esc_pinball(&mut self, ch: u8) -> bool {
        match self.esc_mode {
            EscMode::None => {
                if ch == 0x1B {
                    self.esc_mode = EscMode::Esc;
                } else {
                    return false;
                }
            }
            EscMode::Esc => match ch {
                b'=' | b'>' => self.esc_mode = EscMode::None,
                b'M' => {
                    self.new_line(true, false);
                    self.esc_mode = EscMode::None;
                }
                b'[' => {
                    self.esc_buf.clear();
                    self.esc_mode = EscMode::Csi;
                }
                b']' => self.esc_mode = EscMode::Osc,
                _ => {
                    warn!(ch, "unaccounted ESC sequence");
                    self.esc_mode = EscMode::None;
                }
            },
            EscMode::Csi => {
                let is_final = (ch > 95 && ch < 127) || (ch > 63 && ch < 91);
                if is_final {
                    if ch == b'K' && self.esc_buf.is_empty() {
                        let pos = self.posx;
                        self.trunc_end_line(pos);
                    } else if ch == b'H' {
                        let (row, col) = parse_csi_h(&self.esc_buf);
                        self.safe_move(col, row);
                    } else {
                        warn!(buf = %self.esc_buf, ch, "unaccounted CSI sequence");
                    }
                    self.esc_mode = EscMode::None;
                } else {
                    self.esc_buf.push(ch as char);
                }
            }
            EscMode::Osc => {
                if ch == 0x07 {
                    self.esc_mode = EscMode::None;
                } else if ch == 0x1B {
                    self.esc_mode = EscMode::Esc;
                }
            }
        }
        true
    }

    fn trunc_end_line(&mut self, pos: usize) {
        let keep = pos.saturating_sub(1);
        self.rows_buf[self.posy - 1].truncate(keep);
    }

    fn safe_move(&mut self, col: usize, row: usize) {
        if col > 0 && col <= self.cols {
            self.posx = col;
        } else {
            warn!(col, "_safe_move: out of screen by x axis");
        }
        if row > 0 && row <= self.rows {
            self.posy = row;
        } else {
            warn!(row, "_safe_move: out of screen by y axis");
        }
    }

    fn new_line(&mut self, reverse: bool, wrap: bool) {
        if !reverse {
            self.line_counter += 1;
            if self.posy == self.rows {
                self.rows_buf.remove(0);
                self.rows_buf.push(Vec::new());
                self.wrap[self.posy - 1] = wrap;
                self.wrap.remove(0);
                self.wrap.push(false);
            } else {
                self.wrap[self.posy - 1] = wrap;
                self.posy += 1;
            }
        } else if self.posy == 1 {
            self.rows_buf.pop();
            self.rows_buf.insert(0, Vec::new());
            self.wrap.pop();
            self.wrap.insert(0, false);
        } else {
            self.posy -= 1;
        }
    }

    #[cfg(test)]
    fn set_pos(&mut self, posx: usize, posy: usize) {
        self.posx = posx;
        self.posy = posy;
    }

    #[cfg(test)]
    fn set_wrap(&mut self, wrap: Vec<bool>) {
        self.wrap = wrap;
    }
}

/// Parses the `(\d*);(\d*)` row;col parameter pair out of a CSI `H`
/// sequence's parameter buffer. Absent components default to 1; a
/// buffer with no `;` at all defaults to (1, 1).
fn parse_csi_h(buf: &str) -> (usize, usize) {
    match buf.find(';') {
        Some(idx) => {
            let row = buf[..idx].parse::<usize>().unwrap_or(1);
            let col = buf[idx + 1..].parse::<usize>().unwrap_or(1);
            (row, col)
        }
        None => (1, 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_found_cases() {
        let cases: &[(&[&[u8]], &[u8], bool)] = &[
            (&[b"abc"], b"xyzabczyz", true),
            (&[b"abc"], b"abc", true),
            (&[b"\x1b"], b"\x1b", true),
            (&[b"\x1b[?"], b"xyz\x1b[?zyz", true),
            (&[b"a\x1bbcdefgh"], b"xyza\x1bbcdefghzyz", true),
            (&[b"abc"], b"xyzabzyz", false),
            (&[b"aa x1b 23"], b"aa \x1b 23", false),
            (&[b"aa", b"bb"], b"ababb", true),
            (&[b"(END) \x1b", b"long"], b"a (END) \x1b[K", true),
        ];

        for (anchors, buf, expect) in cases {
            let mut sb = ScreenBuffer::new(80, 24);
            sb.wait_new_anchor(anchors);
            sb.put_data(buf, false);
            assert_eq!(sb.anchor_found(), *expect, "anchors={:?} buf={:?}", anchors, buf);
        }
    }

    #[test]
    #[should_panic]
    fn empty_anchor_set_panics() {
        let mut sb = ScreenBuffer::new(80, 24);
        sb.wait_new_anchor(&[]);
    }

    #[test]
    fn cursor_position_cases() {
        let cases: &[(usize, usize, &[u8], usize, usize)] = &[
            (1, 1, b"1234567890", 11, 1),
            (1, 1, b"123", 4, 1),
            (1, 10, b"a", 2, 10),
            (1, 10, b"1234567890", 11, 10),
            (1, 1, b"backspace! \x08", 1, 2),
            (1, 1, b"backspace! \x08\r\n", 1, 3),
            (1, 1, b"\r\n", 1, 2),
            (10, 1, b"\r\n", 1, 2),
            (5, 1, b"\r", 1, 1),
            (5, 1, b"\n", 5, 2),
            (10, 1, b"a\r\nb", 2, 2),
            (1, 1, b"abc\x1bM", 4, 1),
            (1, 3, b"abc\x1bM", 4, 2),
            (1, 3, b"abc\x1b[H", 1, 1),
            (1, 3, b"abc\x1b[10;4H", 4, 10),
            (1, 10, b"abc\r\x1b[K", 1, 10),
            (1, 5, b"a\x1bMbc", 4, 4),
            (1, 1, b"a\x1bMbc", 4, 1),
        ];

        for (posx, posy, buf, newx, newy) in cases {
            let mut sb = ScreenBuffer::new(10, 10);
            sb.set_pos(*posx, *posy);
            sb.put_data(buf, false);
            assert_eq!(sb.posx(), *newx, "buf={:?}", buf);
            assert_eq!(sb.posy(), *newy, "buf={:?}", buf);
        }
    }

    #[test]
    fn render_cases() {
        let cases: &[(usize, usize, &[u8], &str)] = &[
            (1, 1, b"a", "a\n\n\n\n"),
            (1, 1, b"1234567890", "1234567890\n\n\n\n"),
            (1, 1, b"1234567890 \x08ab", "1234567890ab\n\n\n"),
            (1, 1, b"\x1b=", "\n\n\n\n"),
            (1, 1, b"a\r\na\r\na\r\na\r\na", "a\na\na\na\n"),
            (1, 1, b"0123456789\r\nb", "0123456789\nb\n\n\n"),
            (1, 1, b"abc\x1bM", "\nabc\n\n\n"),
            (1, 1, b"abcde\x1b[1;2H\x1b[K", "a\n\n\n\n"),
            (1, 5, b"abc\r\x1b[K", "\n\n\n\n"),
        ];

        for (posx, posy, buf, expect) in cases {
            let mut sb = ScreenBuffer::new(10, 5);
            sb.set_pos(*posx, *posy);
            sb.put_data(buf, false);
            assert_eq!(sb.render(), *expect, "buf={:?}", buf);
        }
    }

    #[test]
    fn wraps_last_line_correctly() {
        let mut sb = ScreenBuffer::new(10, 5);
        sb.set_pos(1, 5);
        sb.set_wrap(vec![true, false, false, true, false]);
        sb.put_data(b"0123456789a", false);
        assert_eq!(sb.wrap, vec![false, false, true, true, false]);
    }

    #[test]
    fn ignores_unaccounted_escapes() {
        let cases: &[(&[u8], &str)] = &[
            (b"a\x1b=b", "ab\n\n\n\n"),
            (b"a\x1b[?1049l", "a\n\n\n\n"),
        ];
        for (buf, expect) in cases {
            let mut sb = ScreenBuffer::new(10, 5);
            sb.set_pos(1, 1);
            sb.put_data(buf, false);
            assert_eq!(sb.render(), *expect);
        }
    }

    #[test]
    fn current_line_tracks_the_cursor_row() {
        let mut sb = ScreenBuffer::new(10, 5);
        sb.put_data(b"first\r\nsecond", false);
        assert_eq!(sb.current_line(), "second");

        sb.set_pos(1, 1);
        assert_eq!(sb.current_line(), "first");
    }

    #[test]
    fn csi_h_zero_component_is_left_unchanged() {
        let mut sb = ScreenBuffer::new(10, 5);
        sb.set_pos(3, 3);
        sb.put_data(b"\x1b[0;5H", false);
        // row component is 0 (out of range): row left unchanged, col applied
        assert_eq!(sb.posx(), 5);
        assert_eq!(sb.posy(), 3);
    }
}
