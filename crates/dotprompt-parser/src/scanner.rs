use dotprompt_common::StatementKind;

/// One non-blank source line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line<'src> {
    /// 1-based line number.
    pub number: usize,
    /// 0-based byte offset of the line start.
    pub offset: usize,
    /// `None` for implicit continuation lines.
    pub kind: Option<StatementKind>,
    /// Text after the keyword (or the whole line for continuations),
    /// with trailing whitespace removed.
    pub payload: &'src str,
    /// Byte length of the line without its terminator.
    pub len: usize,
}

/// Splits script text into classified lines, dropping blank ones.
///
/// Both `\n` and `\r\n` terminators are accepted.
pub struct Scanner<'src> {
    source: &'src str,
    /// Byte offset of the next line to read.
    offset: usize,
    line: usize,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            offset: 0,
            line: 0,
        }
    }

    fn next_raw(&mut self) -> Option<(usize, usize, &'src str)> {
        if self.offset >= self.source.len() {
            return None;
        }
        let rest = &self.source[self.offset..];
        let (raw, consumed) = match rest.find('\n') {
            Some(idx) => (&rest[..idx], idx + 1),
            None => (rest, rest.len()),
        };
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        let start = self.offset;
        self.offset += consumed;
        self.line += 1;
        Some((self.line, start, raw))
    }
}

impl<'src> Iterator for Scanner<'src> {
    type Item = Line<'src>;

    fn next(&mut self) -> Option<Line<'src>> {
        loop {
            let (number, offset, raw) = self.next_raw()?;
            let text = raw.trim_end();
            if text.trim_start().is_empty() {
                continue;
            }
            return Some(classify(number, offset, raw.len(), text));
        }
    }
}

fn classify(number: usize, offset: usize, len: usize, text: &str) -> Line<'_> {
    let (head, rest) = match text.find(' ') {
        Some(idx) => (&text[..idx], text[idx + 1..].trim_start()),
        None => (text, ""),
    };
    match StatementKind::from_keyword(head) {
        Some(kind) => Line {
            number,
            offset,
            kind: Some(kind),
            payload: rest,
            len,
        },
        None => Line {
            number,
            offset,
            kind: None,
            payload: text,
            len,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(source: &str) -> Vec<Line<'_>> {
        Scanner::new(source).collect()
    }

    #[test]
    fn blank_lines_are_dropped() {
        let lines = scan("\n   \n.user hi\n\t\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].number, 3);
        assert_eq!(lines[0].offset, 5);
        assert_eq!(lines[0].kind, Some(StatementKind::UserMsg));
        assert_eq!(lines[0].payload, "hi");
    }

    #[test]
    fn keyword_must_be_in_column_zero() {
        let lines = scan("  .user indented\n.user   spaced   \n");
        assert_eq!(lines[0].kind, None);
        assert_eq!(lines[0].payload, "  .user indented");
        assert_eq!(lines[1].kind, Some(StatementKind::UserMsg));
        assert_eq!(lines[1].payload, "spaced");
    }

    #[test]
    fn unknown_dot_word_is_continuation() {
        let lines = scan(".users are here\n.exec\n");
        assert_eq!(lines[0].kind, None);
        assert_eq!(lines[1].kind, Some(StatementKind::Exec));
        assert_eq!(lines[1].payload, "");
    }

    #[test]
    fn crlf_terminators() {
        let lines = scan(".system be brief\r\n.user hi\r\n");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].payload, "be brief");
        assert_eq!(lines[1].number, 2);
        assert_eq!(lines[1].len, 8);
    }
}
