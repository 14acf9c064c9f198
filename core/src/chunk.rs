//! Text splitting for chunked synthesis.
//!
//! Fallback order: sentence packing, then word packing for oversized
//! sentences, then a single oversized token emitted verbatim. Content is
//! never discarded; only inter-chunk whitespace is normalized.

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split `text` into chunks of at most `max_len` characters, preferring
/// sentence boundaries. A single word longer than `max_len` becomes its own
/// (oversized) chunk rather than being dropped or truncated.
pub fn split_text(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if char_len(trimmed) <= max_len {
        return vec![trimmed.to_string()];
    }

    let mut chunks = Vec::new();
    let mut buffer = String::new();

    for sentence in split_sentences(trimmed) {
        let sentence_len = char_len(&sentence);

        if sentence_len > max_len {
            flush(&mut chunks, &mut buffer);
            pack_words(&sentence, max_len, &mut chunks);
            continue;
        }

        let joined_len = if buffer.is_empty() {
            sentence_len
        } else {
            char_len(&buffer) + 1 + sentence_len
        };
        if joined_len > max_len {
            flush(&mut chunks, &mut buffer);
        }
        if !buffer.is_empty() {
            buffer.push(' ');
        }
        buffer.push_str(&sentence);
    }

    flush(&mut chunks, &mut buffer);
    chunks
}

fn flush(chunks: &mut Vec<String>, buffer: &mut String) {
    if !buffer.trim().is_empty() {
        chunks.push(std::mem::take(buffer).trim().to_string());
    } else {
        buffer.clear();
    }
}

/// Sentence boundary: terminal punctuation followed by whitespace (or end of
/// input). Punctuation stays attached to its sentence; runs like "?!" are
/// kept whole because the boundary requires trailing whitespace.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().map(|n| n.is_whitespace()).unwrap_or(true);
            if at_boundary {
                let sentence = current.trim();
                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
                current.clear();
            }
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// Greedy word packing for a sentence that alone exceeds the limit.
fn pack_words(sentence: &str, max_len: usize, chunks: &mut Vec<String>) {
    let mut buffer = String::new();
    for word in sentence.split_whitespace() {
        let word_len = char_len(word);

        if word_len > max_len {
            flush(chunks, &mut buffer);
            // Oversized atomic token: emit verbatim.
            chunks.push(word.to_string());
            continue;
        }

        let joined_len = if buffer.is_empty() {
            word_len
        } else {
            char_len(&buffer) + 1 + word_len
        };
        if joined_len > max_len {
            flush(chunks, &mut buffer);
        }
        if !buffer.is_empty() {
            buffer.push(' ');
        }
        buffer.push_str(word);
    }
    flush(chunks, &mut buffer);
}
