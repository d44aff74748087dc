use serde::{Deserialize, Serialize};

const STRONG_MARKS: &[char] = &['。', '．', '.', '！', '!', '？', '?', '\n'];
const WEAK_MARKS: &[char] = &['，', ',', '、', '；', ';', '：', ':'];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SegmenterOption {
    /// A weak pause mark flushes only once this many characters are
    /// buffered; one-word fragments make for terrible synthesis.
    pub min_flush_chars: usize,
    /// Unconditional flush point, bounding worst-case latency on long
    /// unpunctuated spans.
    pub max_buffer_chars: usize,
}

impl Default for SegmenterOption {
    fn default() -> Self {
        Self {
            min_flush_chars: 6,
            max_buffer_chars: 25,
        }
    }
}

/// Turns an incremental token stream into speakable sentence fragments.
/// Pure buffering logic, no I/O: the caller feeds chunks and forwards the
/// returned fragments to the TTS player.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    option: SegmenterOption,
    buf: String,
}

impl SentenceSegmenter {
    pub fn new(option: SegmenterOption) -> Self {
        Self {
            option,
            buf: String::new(),
        }
    }

    /// Append a token chunk; returns every fragment ready for synthesis.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();
        loop {
            let Some(boundary) = self.find_boundary() else {
                break;
            };
            let fragment: String = self.buf.drain(..boundary).collect();
            let fragment = fragment.trim().to_string();
            if !fragment.is_empty() {
                out.push(fragment);
            }
        }
        if self.buf.chars().count() >= self.option.max_buffer_chars {
            let fragment = std::mem::take(&mut self.buf);
            let fragment = fragment.trim().to_string();
            if !fragment.is_empty() {
                out.push(fragment);
            }
        }
        out
    }

    /// Flush whatever remains when the token stream ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim().to_string();
        if rest.is_empty() { None } else { Some(rest) }
    }

    pub fn buffered_chars(&self) -> usize {
        self.buf.chars().count()
    }

    /// Byte offset just past the first flushable delimiter, if any.
    fn find_boundary(&self) -> Option<usize> {
        let mut chars_seen = 0usize;
        for (idx, ch) in self.buf.char_indices() {
            chars_seen += 1;
            let end = idx + ch.len_utf8();
            if STRONG_MARKS.contains(&ch) {
                return Some(end);
            }
            if WEAK_MARKS.contains(&ch) && chars_seen >= self.option.min_flush_chars {
                return Some(end);
            }
        }
        None
    }
}
