
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Characters per estimated token. Fixed so chunking never depends on a tokenizer.
const CHARS_PER_TOKEN: usize = 4;

const PARAGRAPH_SEPARATOR: &str = "\n\n";
const SENTENCE_SEPARATOR: &str = " ";

/// A token-bounded piece of a source document, ready for embedding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// The chunk text
    pub text: String,
    /// Identifier of the document this chunk was cut from
    pub source_id: String,
    /// Position of this chunk within the document, starting at 0
    pub index: usize,
    /// Number of chunks the document produced
    pub total_chunks: usize,
}

/// Configuration for content chunking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Per-document token budget for a single chunk
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self { max_tokens: 500 }
    }
}

/// Estimate token count as character length divided by four, rounded up
#[inline]
pub fn estimate_token_count(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Split text into pieces whose estimated token count stays within `max_tokens`.
///
/// Paragraphs (blank-line separated) are packed greedily. A paragraph that is
/// too large on its own is broken at sentence boundaries and its sentences are
/// packed the same way. A sentence that is still too large is emitted whole.
/// Output preserves input order and drops whitespace-only pieces.
#[inline]
pub fn chunk_text(text: &str, max_tokens: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut buffer = String::new();

    for paragraph in split_paragraphs(text) {
        if estimate_token_count(paragraph) > max_tokens {
            flush(&mut buffer, &mut chunks);
            chunks.extend(pack(split_sentences(paragraph), SENTENCE_SEPARATOR, max_tokens));
            continue;
        }

        if !fits(&buffer, paragraph, PARAGRAPH_SEPARATOR, max_tokens) {
            flush(&mut buffer, &mut chunks);
        }
        append(&mut buffer, paragraph, PARAGRAPH_SEPARATOR);
    }

    flush(&mut buffer, &mut chunks);
    chunks
}

/// Chunk a document and attach source bookkeeping to every piece
#[inline]
pub fn chunk_document(source_id: &str, text: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    let pieces = chunk_text(text, config.max_tokens);
    let total_chunks = pieces.len();

    debug!(
        "Chunked document '{}' into {} chunks (avg {} tokens)",
        source_id,
        total_chunks,
        pieces.iter().map(|p| estimate_token_count(p)).sum::<usize>() / total_chunks.max(1)
    );

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk {
            text,
            source_id: source_id.to_string(),
            index,
            total_chunks,
        })
        .collect()
}

/// Greedily pack atomic units into buffers no larger than the budget
fn pack<'a, I>(units: I, separator: &str, max_tokens: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut packed = Vec::new();
    let mut buffer = String::new();

    for unit in units {
        if !fits(&buffer, unit, separator, max_tokens) {
            flush(&mut buffer, &mut packed);
        }
        append(&mut buffer, unit, separator);
    }

    flush(&mut buffer, &mut packed);
    packed
}

fn fits(buffer: &str, piece: &str, separator: &str, max_tokens: usize) -> bool {
    if buffer.is_empty() {
        return true;
    }
    let combined = buffer.chars().count() + separator.chars().count() + piece.chars().count();
    combined.div_ceil(CHARS_PER_TOKEN) <= max_tokens
}

fn append(buffer: &mut String, piece: &str, separator: &str) {
    if !buffer.is_empty() {
        buffer.push_str(separator);
    }
    buffer.push_str(piece);
}

fn flush(buffer: &mut String, chunks: &mut Vec<String>) {
    if !buffer.trim().is_empty() {
        chunks.push(std::mem::take(buffer));
    }
    buffer.clear();
}

/// Blank-line separated blocks, trimmed, empty blocks dropped
fn split_paragraphs(text: &str) -> Vec<&str> {
    let mut paragraphs = Vec::new();
    let mut start: Option<usize> = None;
    let mut end = 0;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        if line.trim().is_empty() {
            if let Some(s) = start.take() {
                paragraphs.extend(text.get(s..end));
            }
        } else {
            if start.is_none() {
                start = Some(offset);
            }
            end = offset + line.len();
        }
        offset += line.len();
    }

    if let Some(s) = start {
        paragraphs.extend(text.get(s..end));
    }

    paragraphs
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Sentences end at a run of `.`, `!` or `?` followed by whitespace or end of text.
/// The terminator stays with its sentence.
fn split_sentences(paragraph: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = paragraph.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }

        let mut end = i + c.len_utf8();
        while let Some(&(j, next)) = chars.peek() {
            if matches!(next, '.' | '!' | '?') {
                end = j + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }

        let at_boundary = chars.peek().is_none_or(|&(_, next)| next.is_whitespace());
        if at_boundary {
            sentences.extend(paragraph.get(start..end));
            start = end;
        }
    }

    if start < paragraph.len() {
        sentences.extend(paragraph.get(start..));
    }

    sentences
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
