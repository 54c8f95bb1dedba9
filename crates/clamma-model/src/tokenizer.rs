//! SentencePiece-style BPE tokenizer (spec component F): vocab load,
//! greedy-merge encode, and byte-fallback/hex-escape decode.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{ModelError, Result};

pub const TOK_UNK: u32 = 0;
pub const TOK_BOS: u32 = 1;
pub const TOK_EOS: u32 = 2;

/// One vocabulary entry, sorted-by-string for binary search.
struct SortedEntry {
    text: String,
    id: u32,
}

/// The loaded vocabulary: parallel `vocab`/`scores` arrays plus a
/// string-sorted index for `str_lookup`.
pub struct Vocab {
    vocab: Vec<String>,
    scores: Vec<f32>,
    sorted: Vec<SortedEntry>,
    max_token_length: u32,
}

fn read_u32(f: &mut File) -> Result<u32> {
    let mut buf = [0u8; 4];
    f.read_exact(&mut buf)
        .map_err(|_| ModelError::BadTokenizer("truncated u32".into()))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f32(f: &mut File) -> Result<f32> {
    let mut buf = [0u8; 4];
    f.read_exact(&mut buf)
        .map_err(|_| ModelError::BadTokenizer("truncated f32".into()))?;
    Ok(f32::from_le_bytes(buf))
}

impl Vocab {
    /// Load `vocab_size` entries of `(f32 score, u32 len, u8[len] bytes)`
    /// following a leading `u32 max_token_length`, trying `path` then the
    /// build-time default search path if `path` doesn't open directly.
    pub fn load(path: &Path, vocab_size: usize, search_path: Option<&Path>) -> Result<Self> {
        let mut file = File::open(path).or_else(|open_err| {
            let fallback = search_path.map(|base| base.join(path));
            match fallback {
                Some(fallback_path) => File::open(&fallback_path).map_err(|_| {
                    ModelError::NotFound {
                        path: path.display().to_string(),
                        fallback: fallback_path.display().to_string(),
                    }
                }),
                None => Err(ModelError::Io(open_err)),
            }
        })?;

        let max_token_length = read_u32(&mut file)?;
        let mut vocab = Vec::with_capacity(vocab_size);
        let mut scores = Vec::with_capacity(vocab_size);

        for _ in 0..vocab_size {
            let score = read_f32(&mut file)?;
            let len = read_u32(&mut file)? as usize;
            let mut bytes = vec![0u8; len];
            file.read_exact(&mut bytes)
                .map_err(|_| ModelError::BadTokenizer("truncated vocab entry".into()))?;
            let text = String::from_utf8_lossy(&bytes).into_owned();
            scores.push(score);
            vocab.push(text);
        }

        let mut sorted: Vec<SortedEntry> = vocab
            .iter()
            .enumerate()
            .map(|(id, text)| SortedEntry {
                text: text.clone(),
                id: id as u32,
            })
            .collect();
        sorted.sort_by(|a, b| a.text.cmp(&b.text));

        Ok(Vocab {
            vocab,
            scores,
            sorted,
            max_token_length,
        })
    }

    pub fn len(&self) -> usize {
        self.vocab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vocab.is_empty()
    }

    pub fn max_token_length(&self) -> u32 {
        self.max_token_length
    }

    /// `str_lookup`: binary search the string-sorted index.
    fn lookup(&self, s: &str) -> Option<u32> {
        self.sorted
            .binary_search_by(|e| e.text.as_str().cmp(s))
            .ok()
            .map(|idx| self.sorted[idx].id)
    }

    /// Encode `text` into token ids.
    ///
    /// 1. optional BOS, 2. a dummy `" "`-token prefix when `text` is
    /// non-empty, 3. per-codepoint lookup with byte fallback (`byte + 3`),
    /// 4. greedy BPE merge by highest-scoring adjacent pair, 5. optional EOS.
    pub fn encode(&self, text: &str, add_bos: bool, add_eos: bool) -> Result<Vec<u32>> {
        if text.is_empty() && !add_bos && !add_eos {
            return Err(ModelError::EmptyInput);
        }

        let mut tokens = Vec::with_capacity(text.len() + 3);

        if add_bos {
            tokens.push(TOK_BOS);
        }

        if !text.is_empty() {
            let space_id = self
                .lookup(" ")
                .ok_or_else(|| ModelError::BadTokenizer("vocab has no ' ' entry".into()))?;
            tokens.push(space_id);
        }

        let bytes = text.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let mut j = i + 1;
            while j < bytes.len() && (bytes[j] & 0xC0) == 0x80 {
                j += 1;
            }
            let codepoint = std::str::from_utf8(&bytes[i..j]).unwrap_or("");
            match self.lookup(codepoint) {
                Some(id) => tokens.push(id),
                None => {
                    for &b in &bytes[i..j] {
                        tokens.push(b as u32 + 3);
                    }
                }
            }
            i = j;
        }

        loop {
            let mut best_score = f32::NEG_INFINITY;
            let mut best_id = None;
            let mut best_idx = None;

            for idx in 0..tokens.len().saturating_sub(1) {
                let merged = format!(
                    "{}{}",
                    self.vocab[tokens[idx] as usize],
                    self.vocab[tokens[idx + 1] as usize]
                );
                if let Some(id) = self.lookup(&merged) {
                    let score = self.scores[id as usize];
                    if score > best_score {
                        best_score = score;
                        best_id = Some(id);
                        best_idx = Some(idx);
                    }
                }
            }

            let (Some(idx), Some(id)) = (best_idx, best_id) else {
                break;
            };
            tokens[idx] = id;
            tokens.remove(idx + 1);
        }

        if add_eos {
            tokens.push(TOK_EOS);
        }

        Ok(tokens)
    }

    /// Decode `(prev_token, token)` into a displayable UTF-8 fragment.
    ///
    /// Strips a leading space after BOS, expands `<0xAB>` hex-escape forms
    /// into their raw byte, and otherwise returns the vocab string verbatim.
    ///
    /// Returns raw bytes rather than a `String`: a hex-escaped piece may
    /// decode to a byte ≥ 0x80 that isn't valid UTF-8 on its own (byte
    /// fallback emits one raw byte per unrecognized input byte), and the
    /// caller's emission filter needs that raw byte, not a lossy
    /// replacement, to match it against the printable/whitespace test.
    pub fn decode(&self, prev_token: u32, token: u32) -> Vec<u8> {
        let piece = self.vocab[token as usize].as_str();
        let piece = if prev_token == TOK_BOS {
            piece.strip_prefix(' ').unwrap_or(piece)
        } else {
            piece
        };

        if let Some(byte) = parse_hex_escape(piece) {
            return vec![byte];
        }

        piece.as_bytes().to_vec()
    }
}

/// Parse a `"<0xAB>"`-shaped piece into the single raw byte it encodes.
fn parse_hex_escape(piece: &str) -> Option<u8> {
    let body = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if body.len() != 2 {
        return None;
    }
    u8::from_str_radix(body, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_vocab_fixture(entries: &[(&str, f32)]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let max_len = entries.iter().map(|(s, _)| s.len()).max().unwrap_or(0) as u32;
        f.write_all(&max_len.to_le_bytes()).unwrap();
        for (s, score) in entries {
            f.write_all(&score.to_le_bytes()).unwrap();
            f.write_all(&(s.len() as u32).to_le_bytes()).unwrap();
            f.write_all(s.as_bytes()).unwrap();
        }
        f.flush().unwrap();
        f
    }

    fn small_vocab() -> (tempfile::NamedTempFile, usize) {
        let entries = [
            ("<unk>", -1.0),
            ("\n", -1.0),
            ("\n", -1.0),
            (" ", 0.0),
            ("h", 0.0),
            ("e", 0.0),
            ("l", 0.0),
            ("o", 0.0),
            ("he", 1.0),
            ("hel", 2.0),
            ("hell", 3.0),
            ("hello", 4.0),
        ];
        let f = write_vocab_fixture(&entries);
        (f, entries.len())
    }

    #[test]
    fn encode_empty_with_bos_eos_has_no_dummy_prefix() {
        let (f, n) = small_vocab();
        let v = Vocab::load(f.path(), n, None).unwrap();
        let tokens = v.encode("", true, true).unwrap();
        assert_eq!(tokens, vec![TOK_BOS, TOK_EOS]);
    }

    #[test]
    fn encode_merges_greedily_by_score() {
        let (f, n) = small_vocab();
        let v = Vocab::load(f.path(), n, None).unwrap();
        let tokens = v.encode("hello", false, false).unwrap();
        // dummy-space prefix, then "hello" should merge down to one token.
        assert_eq!(tokens.len(), 2);
        assert_eq!(v.vocab[tokens[1] as usize], "hello");
    }

    #[test]
    fn decode_strips_leading_space_after_bos() {
        let (f, n) = small_vocab();
        let v = Vocab::load(f.path(), n, None).unwrap();
        let space_id = v.lookup(" ").unwrap();
        assert_eq!(v.decode(TOK_BOS, space_id), Vec::<u8>::new());
    }

    #[test]
    fn decode_expands_hex_escape() {
        let entries = [("<unk>", -1.0), ("\n", -1.0), ("\n", -1.0), ("<0x41>", 0.0)];
        let f = write_vocab_fixture(&entries);
        let v = Vocab::load(f.path(), entries.len(), None).unwrap();
        assert_eq!(v.decode(TOK_EOS, 3), vec![b'A']);
    }

    #[test]
    fn decode_expands_hex_escape_for_a_high_byte_without_utf8_replacement() {
        // 0xAB is not valid standalone UTF-8; decode must hand back the raw
        // byte, not `String::from_utf8_lossy`'s 3-byte U+FFFD replacement,
        // so the session's emission filter can still see a single byte.
        let entries = [("<unk>", -1.0), ("\n", -1.0), ("\n", -1.0), ("<0xAB>", 0.0)];
        let f = write_vocab_fixture(&entries);
        let v = Vocab::load(f.path(), entries.len(), None).unwrap();
        let decoded = v.decode(TOK_EOS, 3);
        assert_eq!(decoded, vec![0xABu8]);
    }

    #[test]
    fn empty_text_with_no_bos_eos_is_rejected_not_panicking() {
        let (f, n) = small_vocab();
        let v = Vocab::load(f.path(), n, None).unwrap();
        assert!(v.encode("", false, false).is_err());
    }

    #[test]
    fn byte_fallback_encodes_unknown_bytes() {
        let entries = [("<unk>", -1.0), ("\n", -1.0), ("\n", -1.0), (" ", 0.0)];
        let f = write_vocab_fixture(&entries);
        let v = Vocab::load(f.path(), entries.len(), None).unwrap();
        let tokens = v.encode("x", false, false).unwrap();
        // no vocab entry for "x" or " x": dummy space (id 3), then byte fallback for 'x'.
        assert_eq!(tokens, vec![3, b'x' as u32 + 3]);
    }
}
