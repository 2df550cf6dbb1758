/// Splits a document into ordered chunks of at most `max_chars` characters.
/// Paragraphs (blank-line separated) are packed greedily; a paragraph that
/// is too long on its own is split on whitespace, and a single oversized
/// word is split on character boundaries.
pub fn chunk_text(content: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in content.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        for piece in split_long(paragraph, max_chars) {
            let needed = if current.is_empty() {
                piece.chars().count()
            } else {
                current.chars().count() + 2 + piece.chars().count()
            };

            if needed > max_chars && !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(&piece);
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_long(paragraph: &str, max_chars: usize) -> Vec<String> {
    if paragraph.chars().count() <= max_chars {
        return vec![paragraph.to_string()];
    }

    let mut pieces = Vec::new();
    let mut current = String::new();
    for word in paragraph.split_whitespace() {
        for part in split_word(word, max_chars) {
            let len = current.chars().count();
            if len > 0 && len + 1 + part.chars().count() > max_chars {
                pieces.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&part);
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

fn split_word(word: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    chars.chunks(max_chars).map(|c| c.iter().collect()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_document_is_one_chunk() {
        assert_eq!(chunk_text("Force causes acceleration.", 100), vec!["Force causes acceleration."]);
    }

    #[test]
    fn empty_document_has_no_chunks() {
        assert!(chunk_text("  \n\n  ", 100).is_empty());
    }

    #[test]
    fn paragraphs_are_packed_until_the_limit() {
        let doc = "aaaa\n\nbbbb\n\ncccc";
        assert_eq!(chunk_text(doc, 10), vec!["aaaa\n\nbbbb", "cccc"]);
    }

    #[test]
    fn long_paragraph_splits_on_words() {
        let doc = "one two three four five six";
        let chunks = chunk_text(doc, 9);
        assert!(chunks.iter().all(|c| c.chars().count() <= 9));
        assert_eq!(chunks.join(" "), doc);
    }

    #[test]
    fn oversized_word_is_hard_split() {
        let chunks = chunk_text("abcdefghij", 4);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn multibyte_text_respects_char_limit() {
        let chunks = chunk_text("ééééé ééééé", 5);
        assert!(chunks.iter().all(|c| c.chars().count() <= 5));
        assert_eq!(chunks.len(), 2);
    }
}
