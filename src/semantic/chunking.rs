//! Overlapping text splitter for embedding input.
//!
//! Text is split recursively on paragraph breaks, line breaks, spaces and
//! finally single characters until every piece fits `chunk_size`; pieces are
//! then merged back greedily, carrying up to `chunk_overlap` characters of
//! trailing context into the next chunk. Sizes are measured in characters.

use std::collections::VecDeque;

const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

#[derive(Debug, Clone, Copy)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
        }
    }

    /// Split `text` into non-empty chunks of at most `chunk_size` characters.
    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, &SEPARATORS)
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let (position, separator) = separators
            .iter()
            .enumerate()
            .find(|(_, sep)| sep.is_empty() || text.contains(*sep))
            .map(|(idx, sep)| (idx, *sep))
            .unwrap_or((separators.len().saturating_sub(1), ""));
        let remaining = &separators[(position + 1).min(separators.len())..];

        let pieces: Vec<&str> = if separator.is_empty() {
            text.char_indices()
                .map(|(idx, ch)| &text[idx..idx + ch.len_utf8()])
                .collect()
        } else {
            text.split(separator).filter(|s| !s.is_empty()).collect()
        };

        let mut chunks = Vec::new();
        let mut fitting: Vec<&str> = Vec::new();

        for piece in pieces {
            if char_len(piece) < self.chunk_size {
                fitting.push(piece);
                continue;
            }

            if !fitting.is_empty() {
                chunks.extend(self.merge(&fitting, separator));
                fitting.clear();
            }

            if remaining.is_empty() {
                chunks.push(piece.to_string());
            } else {
                chunks.extend(self.split_with(piece, remaining));
            }
        }

        if !fitting.is_empty() {
            chunks.extend(self.merge(&fitting, separator));
        }

        chunks
    }

    fn merge(&self, pieces: &[&str], separator: &str) -> Vec<String> {
        let separator_len = char_len(separator);
        let joined_len = |current: &VecDeque<&str>| if current.is_empty() { 0 } else { separator_len };

        let mut chunks = Vec::new();
        let mut current: VecDeque<&str> = VecDeque::new();
        let mut total = 0;

        for piece in pieces {
            let len = char_len(piece);

            if total + len + joined_len(&current) > self.chunk_size {
                if !current.is_empty() {
                    push_chunk(&mut chunks, &current, separator);

                    while total > self.chunk_overlap
                        || (total > 0 && total + len + joined_len(&current) > self.chunk_size)
                    {
                        let Some(first) = current.pop_front() else {
                            break;
                        };
                        total -= char_len(first) + if current.is_empty() { 0 } else { separator_len };
                    }
                }
            }

            total += len + joined_len(&current);
            current.push_back(piece);
        }

        push_chunk(&mut chunks, &current, separator);
        chunks
    }
}

fn push_chunk(chunks: &mut Vec<String>, current: &VecDeque<&str>, separator: &str) {
    let chunk = current.iter().copied().collect::<Vec<_>>().join(separator);
    let chunk = chunk.trim();
    if !chunk.is_empty() {
        chunks.push(chunk.to_string());
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
