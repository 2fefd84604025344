//! Sentence chunking for the LLM -> TTS cutover.
//!
//! The model streams text in arbitrary deltas; TTS wants whole sentences.
//! The chunker yields completed sentences as soon as they exist so the
//! first sentence can start synthesizing while the rest of the response is
//! still being generated.

/// Default overflow guard for the trailing fragment, in characters.
pub const MAX_BUFFER_CHARS: usize = 2000;

/// Sentence terminators. Covers Korean endings (`다.`, `요.`, `~`) via the
/// trailing ASCII character.
const TERMINATORS: [char; 4] = ['.', '!', '?', '~'];

/// Incremental sentence splitter over an append-only text stream.
pub struct SentenceChunker {
    buffer: String,
    max_buffer_chars: usize,
}

impl SentenceChunker {
    /// Create a chunker with the given overflow guard.
    pub fn new(max_buffer_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            max_buffer_chars,
        }
    }

    /// Append a delta and drain any sentences it completed.
    ///
    /// A sentence ends at `.`, `!`, `?`, or `~` followed by whitespace or
    /// the end of the buffer. An ellipsis counts once, at its last `.`.
    /// If the trailing fragment exceeds the overflow guard it is emitted
    /// whole so the buffer cannot grow without bound.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);

        let mut completed = Vec::new();
        loop {
            let Some(split_at) = self.find_split() else {
                break;
            };
            let rest = self.buffer.split_off(split_at);
            let sentence = std::mem::replace(&mut self.buffer, rest);
            push_nonempty(&mut completed, &sentence);
        }

        // Terminator at end-of-buffer completes the sentence too.
        if self
            .buffer
            .trim_end()
            .ends_with(|c| TERMINATORS.contains(&c))
        {
            let sentence = std::mem::take(&mut self.buffer);
            push_nonempty(&mut completed, &sentence);
        }

        if self.buffer.chars().count() > self.max_buffer_chars {
            let sentence = std::mem::take(&mut self.buffer);
            push_nonempty(&mut completed, &sentence);
        }

        completed
    }

    /// Drain the trailing fragment at end-of-stream, if any.
    pub fn flush(&mut self) -> Option<String> {
        let remainder = std::mem::take(&mut self.buffer);
        let trimmed = remainder.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_owned())
        }
    }

    /// Current fragment length in characters.
    pub fn pending_chars(&self) -> usize {
        self.buffer.chars().count()
    }

    /// Byte index just past the first terminator that is followed by
    /// whitespace. Runs of terminators (ellipses, `?!`) split after the
    /// last character of the run.
    fn find_split(&self) -> Option<usize> {
        let mut iter = self.buffer.char_indices().peekable();
        while let Some((i, c)) = iter.next() {
            if !TERMINATORS.contains(&c) {
                continue;
            }
            if let Some(&(_, next)) = iter.peek()
                && next.is_whitespace()
            {
                return Some(i + c.len_utf8());
            }
        }
        None
    }
}

impl Default for SentenceChunker {
    fn default() -> Self {
        Self::new(MAX_BUFFER_CHARS)
    }
}

fn push_nonempty(out: &mut Vec<String>, sentence: &str) {
    let trimmed = sentence.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_owned());
    }
}

/// Strip characters that streaming TTS engines silently drop, which would
/// otherwise glue adjacent words together. Keeps word characters,
/// whitespace, the sentence punctuation `.,!?`, and square brackets
/// (audio tags).
pub fn sanitize_for_tts(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;
    for c in text.chars() {
        let keep = c.is_alphanumeric()
            || c == '_'
            || c.is_whitespace()
            || matches!(c, '.' | ',' | '!' | '?' | '[' | ']');
        let c = if keep { c } else { ' ' };
        if c == ' ' {
            if last_was_space {
                continue;
            }
            last_was_space = true;
        } else {
            last_was_space = c.is_whitespace();
        }
        out.push(c);
    }
    out.trim().to_owned()
}
