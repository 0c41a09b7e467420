//! Fuzzy string similarity on a 0-100 scale
//!
//! Scores follow the usual "fuzzywuzzy" family: a plain ratio based on the
//! longest common subsequence, a best-window partial ratio, token sort and
//! token set variants, and a weighted ratio choosing among them by the
//! length difference of the inputs.
//!
//! Inputs are processed first: lower-cased, every non-alphanumeric character
//! replaced by a space, and trimmed.

const UNBASE_SCALE: f64 = 0.95;
const PARTIAL_SCALE: f64 = 0.90;
/// Partial scale when one string is more than 8x longer than the other
const LONG_PARTIAL_SCALE: f64 = 0.60;

/// Best overall similarity of two strings
pub fn weighted_ratio(a: &str, b: &str) -> u8 {
    let a = process(a);
    let b = process(b);
    if a.is_empty() || b.is_empty() {
        return 0;
    }

    let base = f64::from(ratio_chars(&a, &b));
    let (len_a, len_b) = (a.len() as f64, b.len() as f64);
    let len_ratio = len_a.max(len_b) / len_a.min(len_b);

    let a = collect(&a);
    let b = collect(&b);
    let best = if len_ratio < 1.5 {
        let sort = f64::from(token_sort(&a, &b, false)) * UNBASE_SCALE;
        let set = f64::from(token_set(&a, &b, false)) * UNBASE_SCALE;
        base.max(sort).max(set)
    } else {
        let partial_scale = if len_ratio > 8.0 {
            LONG_PARTIAL_SCALE
        } else {
            PARTIAL_SCALE
        };
        let partial = f64::from(partial_chars(&a.chars, &b.chars)) * partial_scale;
        let sort = f64::from(token_sort(&a, &b, true)) * UNBASE_SCALE * partial_scale;
        let set = f64::from(token_set(&a, &b, true)) * UNBASE_SCALE * partial_scale;
        base.max(partial).max(sort).max(set)
    };

    best.round() as u8
}

/// Plain similarity of the processed strings
pub fn ratio(a: &str, b: &str) -> u8 {
    ratio_chars(&process(a), &process(b))
}

/// Similarity of the shorter string to its best-matching window in the longer
pub fn partial_ratio(a: &str, b: &str) -> u8 {
    partial_chars(&process(a), &process(b))
}

/// Ratio after sorting the words of both strings
pub fn token_sort_ratio(a: &str, b: &str) -> u8 {
    token_sort(&collect(&process(a)), &collect(&process(b)), false)
}

/// Ratio comparing shared words against each side's remaining words
pub fn token_set_ratio(a: &str, b: &str) -> u8 {
    token_set(&collect(&process(a)), &collect(&process(b)), false)
}

/// Lower-case, map non-alphanumerics to spaces, trim
fn process(s: &str) -> Vec<char> {
    let mapped: String = s
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .flat_map(char::to_lowercase)
        .collect();
    mapped.trim().chars().collect()
}

/// A processed string with its word list
struct Processed {
    chars: Vec<char>,
    tokens: Vec<String>,
}

fn collect(chars: &[char]) -> Processed {
    let text: String = chars.iter().collect();
    Processed {
        chars: chars.to_vec(),
        tokens: text.split_whitespace().map(str::to_string).collect(),
    }
}

fn ratio_chars(a: &[char], b: &[char]) -> u8 {
    (similarity(a, b) * 100.0).round() as u8
}

/// 2 * LCS / (|a| + |b|): the complement of the normalized insert/delete distance
fn similarity(a: &[char], b: &[char]) -> f64 {
    let total = a.len() + b.len();
    if total == 0 {
        return 0.0;
    }
    2.0 * lcs_len(a, b) as f64 / total as f64
}

fn lcs_len(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                curr[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

fn partial_chars(a: &[char], b: &[char]) -> u8 {
    let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if shorter.is_empty() {
        return 0;
    }

    let mut best = 0.0f64;
    for window in longer.windows(shorter.len()) {
        let score = similarity(shorter, window);
        if score > 0.995 {
            return 100;
        }
        best = best.max(score);
    }
    (best * 100.0).round() as u8
}

fn sorted_join<'a>(tokens: impl IntoIterator<Item = &'a String>) -> Vec<char> {
    let mut tokens: Vec<&String> = tokens.into_iter().collect();
    tokens.sort();
    tokens.dedup();
    let joined = tokens
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    joined.chars().collect()
}

fn score(a: &[char], b: &[char], partial: bool) -> u8 {
    if partial {
        partial_chars(a, b)
    } else {
        ratio_chars(a, b)
    }
}

fn token_sort(a: &Processed, b: &Processed, partial: bool) -> u8 {
    let mut sa: Vec<&String> = a.tokens.iter().collect();
    let mut sb: Vec<&String> = b.tokens.iter().collect();
    sa.sort();
    sb.sort();
    let ja: Vec<char> = sa.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(" ").chars().collect();
    let jb: Vec<char> = sb.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(" ").chars().collect();
    score(&ja, &jb, partial)
}

fn token_set(a: &Processed, b: &Processed, partial: bool) -> u8 {
    let intersection = sorted_join(a.tokens.iter().filter(|t| b.tokens.contains(t)));
    let only_a = sorted_join(a.tokens.iter().filter(|t| !b.tokens.contains(t)));
    let only_b = sorted_join(b.tokens.iter().filter(|t| !a.tokens.contains(t)));

    let combine = |rest: &[char]| -> Vec<char> {
        let mut combined = intersection.clone();
        if !combined.is_empty() && !rest.is_empty() {
            combined.push(' ');
        }
        combined.extend_from_slice(rest);
        combined
    };
    let combined_a = combine(&only_a);
    let combined_b = combine(&only_b);

    score(&intersection, &combined_a, partial)
        .max(score(&intersection, &combined_b, partial))
        .max(score(&combined_a, &combined_b, partial))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio() {
        assert_eq!(ratio("invoice", "invoice"), 100);
        assert_eq!(ratio("Invoice!", "  invoice "), 100);
        assert_eq!(ratio("abc", "xyz"), 0);
        // LCS "ab" of 3 + 2 characters
        assert_eq!(ratio("abc", "ab"), 80);
        assert_eq!(ratio("", "abc"), 0);
    }

    #[test]
    fn test_partial_ratio_finds_substring() {
        assert_eq!(partial_ratio("invoice", "monthly invoice"), 100);
        assert_eq!(partial_ratio("monthly invoice", "invoice"), 100);
        assert!(partial_ratio("invoice", "meeting notes") < 60);
    }

    #[test]
    fn test_token_ratios_ignore_word_order() {
        assert_eq!(token_sort_ratio("notes meeting", "Meeting Notes"), 100);
        assert_eq!(token_set_ratio("weekly meeting notes", "notes meeting"), 100);
        assert!(ratio("notes meeting", "meeting notes") < 100);
    }

    #[test]
    fn test_weighted_ratio() {
        assert_eq!(weighted_ratio("invoice", "Monthly Invoice"), 90);
        assert!(weighted_ratio("invoice", "Meeting Notes") <= 60);
        assert!(weighted_ratio("invoice", "bob@example.com") <= 60);
        assert_eq!(weighted_ratio("meeting notes", "Notes: meeting"), 95);
        assert_eq!(weighted_ratio("", "anything"), 0);
        assert_eq!(weighted_ratio("!!!", "anything"), 0);
    }

    #[test]
    fn test_weighted_ratio_long_text_is_scaled_down() {
        let long = format!("{} invoice", "filler text ".repeat(10));
        assert_eq!(weighted_ratio("invoice", &long), 60);
    }
}
