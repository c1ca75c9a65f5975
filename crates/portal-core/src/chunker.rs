//! Split long documents into pieces small enough for one extraction call

/// Largest chunk, in characters, sent through document processing
pub const MAX_CHUNK_SIZE: usize = 15_000;

/// Greedy paragraph packing. Paragraphs (separated by blank lines) are joined
/// with `"\n\n"` while the chunk stays within `max_size`; a paragraph larger
/// than `max_size` on its own is split at sentence ends and packed with single
/// spaces. Lengths are counted in characters.
pub fn chunk_content(content: &str, max_size: usize) -> Vec<String> {
    if char_len(content) <= max_size {
        return vec![content.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in split_paragraphs(content) {
        if char_len(&current) + char_len(paragraph) + 2 > max_size {
            push_trimmed(&mut chunks, &current);

            if char_len(paragraph) > max_size {
                current = String::new();
                for sentence in split_sentences(paragraph) {
                    if char_len(&current) + char_len(sentence) + 1 > max_size {
                        push_trimmed(&mut chunks, &current);
                        current = sentence.to_string();
                    } else {
                        if !current.is_empty() {
                            current.push(' ');
                        }
                        current.push_str(sentence);
                    }
                }
            } else {
                current = paragraph.to_string();
            }
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
        }
    }

    push_trimmed(&mut chunks, &current);
    chunks
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn push_trimmed(chunks: &mut Vec<String>, chunk: &str) {
    if !chunk.is_empty() {
        chunks.push(chunk.trim().to_string());
    }
}

/// Split on runs of two or more newlines
fn split_paragraphs(content: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let bytes = content.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\n' && i + 1 < bytes.len() && bytes[i + 1] == b'\n' {
            parts.push(&content[start..i]);
            while i < bytes.len() && bytes[i] == b'\n' {
                i += 1;
            }
            start = i;
        } else {
            i += 1;
        }
    }
    parts.push(&content[start..]);
    parts
}

/// Split after `.`, `!` or `?` when followed by whitespace; the whitespace
/// run is dropped.
fn split_sentences(paragraph: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut chars = paragraph.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let end = i + c.len_utf8();
        if !matches!(chars.peek(), Some((_, next)) if next.is_whitespace()) {
            continue;
        }
        parts.push(&paragraph[start..end]);
        while matches!(chars.peek(), Some((_, next)) if next.is_whitespace()) {
            chars.next();
        }
        start = chars.peek().map(|(j, _)| *j).unwrap_or(paragraph.len());
    }
    parts.push(&paragraph[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_one_untouched_chunk() {
        let text = "  A short note.\n\nWith two paragraphs.  ";
        assert_eq!(chunk_content(text, 100), vec![text.to_string()]);
    }

    #[test]
    fn test_paragraph_packing_preserves_text() {
        let paragraphs: Vec<String> = (0..12)
            .map(|i| format!("Paragraph {i} {}", "word ".repeat(8).trim_end()))
            .collect();
        let text = paragraphs.join("\n\n");
        let max = 120;
        assert!(text.chars().count() > max);

        let chunks = chunk_content(&text, max);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chars().count() <= max));
        assert_eq!(chunks.join("\n\n"), text);
    }

    #[test]
    fn test_oversized_paragraph_splits_on_sentences() {
        let sentence = "This sentence is about twenty chars.";
        let paragraph = vec![sentence; 6].join(" ");
        let text = format!("Intro.\n\n{paragraph}");

        let chunks = chunk_content(&text, 80);
        assert_eq!(chunks[0], "Intro.");
        assert!(chunks[1..].iter().all(|c| c.chars().count() <= 80));
        assert_eq!(chunks[1..].join(" "), paragraph);
    }

    #[test]
    fn test_sentence_longer_than_limit_passes_through_whole() {
        let long = format!("{}.", "x".repeat(100));
        let text = format!("Intro.\n\n{long} Tail.");

        let chunks = chunk_content(&text, 40);
        assert_eq!(chunks, vec!["Intro.".to_string(), long, "Tail.".to_string()]);
    }

    #[test]
    fn test_blank_line_runs_are_one_separator() {
        assert_eq!(split_paragraphs("a\n\n\n\nb\nc"), vec!["a", "b\nc"]);
    }

    #[test]
    fn test_sentence_split_keeps_punctuation() {
        assert_eq!(
            split_sentences("One. Two!  Three? Four...x. End"),
            vec!["One.", "Two!", "Three?", "Four...x.", "End"]
        );
    }
}
