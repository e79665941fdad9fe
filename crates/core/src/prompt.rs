//! Weighted prompt syntax
//!
//! Prompts may carry emphasis markers that change how strongly a span of
//! text conditions the generated image:
//!
//! - `(red blazer)++` raises the group weight by 1.1 per `+`
//! - `(blurry)--` lowers it by 0.9 per `-`
//! - `(cat)1.3` and `(cat:1.3)` set an explicit multiplier
//! - `word+` / `word-` weight a single word
//! - `\(` and `\)` are literal parentheses
//!
//! Groups nest and their weights multiply. Anything that does not form a
//! balanced group is kept as literal text, so parsing never fails.

const UPWEIGHT: f32 = 1.1;
const DOWNWEIGHT: f32 = 0.9;
const WEIGHT_EPSILON: f32 = 1e-6;
/// Longer text after a colon is never a weight
const MAX_NUMBER_CHARS: usize = 32;

/// A run of prompt text sharing one attention weight
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub text: String,
    pub weight: f32,
}

impl Fragment {
    pub fn new(text: impl Into<String>, weight: f32) -> Self {
        Self {
            text: text.into(),
            weight,
        }
    }
}

/// Split a prompt into weighted fragments.
///
/// Adjacent fragments with the same weight are merged and empty fragments
/// are dropped, so an unweighted prompt yields a single fragment.
pub fn parse_weighted(prompt: &str) -> Vec<Fragment> {
    let chars: Vec<char> = prompt.chars().collect();
    let groups = match_groups(&chars);
    let mut fragments = Vec::new();
    parse_spans(&chars, &groups, &mut fragments);
    merge_fragments(fragments)
}

/// True when every fragment carries the neutral weight
pub fn is_unweighted(fragments: &[Fragment]) -> bool {
    fragments
        .iter()
        .all(|f| (f.weight - 1.0).abs() < WEIGHT_EPSILON)
}

/// A balanced `(...)` group, keyed by the index of its `(`
#[derive(Debug, Clone, Copy)]
struct Group {
    close: usize,
    /// Last colon directly inside the group, not inside a nested one
    colon: Option<usize>,
}

/// Match every parenthesis in one pass; unmatched ones stay `None`.
fn match_groups(chars: &[char]) -> Vec<Option<Group>> {
    let mut groups = vec![None; chars.len()];
    let mut open: Vec<(usize, Option<usize>)> = Vec::new();
    let mut k = 0;
    while k < chars.len() {
        match chars[k] {
            '\\' if k + 1 < chars.len() && matches!(chars[k + 1], '(' | ')') => {
                k += 2;
                continue;
            }
            '(' => open.push((k, None)),
            ')' => {
                if let Some((start, colon)) = open.pop() {
                    groups[start] = Some(Group { close: k, colon });
                }
            }
            ':' => {
                if let Some(top) = open.last_mut() {
                    top.1 = Some(k);
                }
            }
            _ => {}
        }
        k += 1;
    }
    groups
}

/// A span being parsed: text up to `end` at `weight`, continuing at `resume` in the parent
#[derive(Debug, Clone, Copy)]
struct Span {
    end: usize,
    weight: f32,
    resume: usize,
}

/// Walk the prompt with an explicit span stack, so nesting depth costs heap, not call stack.
fn parse_spans(chars: &[char], groups: &[Option<Group>], out: &mut Vec<Fragment>) {
    let mut spans = vec![Span {
        end: chars.len(),
        weight: 1.0,
        resume: chars.len(),
    }];
    let mut text = String::new();
    let mut i = 0;

    while let Some(&Span { end, weight, resume }) = spans.last() {
        if i >= end {
            flush(&mut text, weight, out);
            spans.pop();
            i = resume;
            continue;
        }

        let c = chars[i];
        match c {
            '\\' if i + 1 < end && matches!(chars[i + 1], '(' | ')') => {
                text.push(chars[i + 1]);
                i += 2;
            }
            '(' => {
                let Some(group) = groups[i].filter(|g| g.close < end) else {
                    text.push(c);
                    i += 1;
                    continue;
                };
                flush(&mut text, weight, out);

                let colon_weight = group
                    .colon
                    .and_then(|colon| colon_weight(chars, colon, group.close).map(|w| (colon, w)));
                let (inner_end, marker_weight, next) = match colon_weight {
                    Some((colon, w)) => (colon, w, group.close + 1),
                    None => {
                        let (w, next) = group_marker(chars, group.close + 1, end);
                        (group.close, w, next)
                    }
                };

                spans.push(Span {
                    end: inner_end,
                    weight: weight * marker_weight,
                    resume: next,
                });
                i += 1;
            }
            '+' | '-' => {
                let run_end = marker_run_end(chars, i, end);
                let terminated = run_end == end
                    || chars[run_end].is_whitespace()
                    || chars[run_end] == ',';

                match trailing_word_start(&text) {
                    Some(split) if terminated => {
                        let word = text.split_off(split);
                        flush(&mut text, weight, out);
                        let factor = if c == '+' { UPWEIGHT } else { DOWNWEIGHT };
                        let n = (run_end - i) as i32;
                        out.push(Fragment::new(word, weight * factor.powi(n)));
                    }
                    _ => text.extend(&chars[i..run_end]),
                }
                i = run_end;
            }
            _ => {
                text.push(c);
                i += 1;
            }
        }
    }
}

fn flush(text: &mut String, weight: f32, out: &mut Vec<Fragment>) {
    if !text.is_empty() {
        out.push(Fragment::new(std::mem::take(text), weight));
    }
}

/// `(text:1.3)` form: the number between the group's last top-level colon and its `)`.
fn colon_weight(chars: &[char], colon: usize, close: usize) -> Option<f32> {
    let tail = &chars[colon + 1..close];
    if tail.len() > MAX_NUMBER_CHARS {
        return None;
    }
    let number: String = tail.iter().collect();
    let weight = number.trim().parse::<f32>().ok()?;
    weight.is_finite().then_some(weight)
}

/// Weight markers right after a closing parenthesis: `+`/`-` runs or a number.
fn group_marker(chars: &[char], start: usize, end: usize) -> (f32, usize) {
    if start >= end {
        return (1.0, start);
    }

    match chars[start] {
        '+' | '-' => {
            let run_end = marker_run_end(chars, start, end);
            let factor = if chars[start] == '+' {
                UPWEIGHT
            } else {
                DOWNWEIGHT
            };
            (factor.powi((run_end - start) as i32), run_end)
        }
        c if c.is_ascii_digit() || c == '.' => {
            let mut k = start;
            while k < end && (chars[k].is_ascii_digit() || chars[k] == '.') {
                k += 1;
            }
            let number: String = chars[start..k].iter().collect();
            match number.parse::<f32>() {
                Ok(w) if w.is_finite() => (w, k),
                _ => (1.0, start),
            }
        }
        _ => (1.0, start),
    }
}

fn marker_run_end(chars: &[char], start: usize, end: usize) -> usize {
    let marker = chars[start];
    let mut k = start;
    while k < end && chars[k] == marker {
        k += 1;
    }
    k
}

/// Byte offset where the word ending `text` starts, if `text` ends in a word.
fn trailing_word_start(text: &str) -> Option<usize> {
    let is_word = |c: char| c.is_alphanumeric() || c == '_' || c == '\'';
    if !text.chars().next_back().is_some_and(is_word) {
        return None;
    }
    let start = text
        .char_indices()
        .rev()
        .take_while(|(_, c)| is_word(*c))
        .last()
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    Some(start)
}

fn merge_fragments(fragments: Vec<Fragment>) -> Vec<Fragment> {
    let mut merged: Vec<Fragment> = Vec::with_capacity(fragments.len());
    for fragment in fragments.into_iter().filter(|f| !f.text.is_empty()) {
        match merged.last_mut() {
            Some(last) if (last.weight - fragment.weight).abs() < WEIGHT_EPSILON => {
                last.text.push_str(&fragment.text);
            }
            _ => merged.push(fragment),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_fragments(prompt: &str, expected: &[(&str, f32)]) {
        let fragments = parse_weighted(prompt);
        assert_eq!(
            fragments.len(),
            expected.len(),
            "fragments for {prompt:?}: {fragments:?}"
        );
        for (fragment, (text, weight)) in fragments.iter().zip(expected) {
            assert_eq!(fragment.text, *text);
            assert!(
                (fragment.weight - weight).abs() < 1e-4,
                "weight of {:?} was {}, expected {}",
                fragment.text,
                fragment.weight,
                weight
            );
        }
    }

    #[test]
    fn plain_prompt_is_one_neutral_fragment() {
        assert_fragments("a cat on a sofa", &[("a cat on a sofa", 1.0)]);
        assert!(is_unweighted(&parse_weighted("a cat on a sofa")));
    }

    #[test]
    fn empty_prompt_has_no_fragments() {
        assert!(parse_weighted("").is_empty());
    }

    #[test]
    fn plus_and_minus_markers_scale_groups() {
        assert_fragments(
            "a woman in a (red blazer)++ standing",
            &[("a woman in a ", 1.0), ("red blazer", 1.21), (" standing", 1.0)],
        );
        assert_fragments("(blurry)--", &[("blurry", 0.81)]);
    }

    #[test]
    fn explicit_numeric_weights() {
        assert_fragments("(cat)1.5 and dog", &[("cat", 1.5), (" and dog", 1.0)]);
        assert_fragments("(fox:0.5), forest", &[("fox", 0.5), (", forest", 1.0)]);
        assert_fragments("(fox: 1.3)", &[("fox", 1.3)]);
    }

    #[test]
    fn nested_groups_multiply() {
        assert_fragments(
            "((cat)+ hat)2",
            &[("cat", 2.2), (" hat", 2.0)],
        );
    }

    #[test]
    fn bare_group_only_groups() {
        assert_fragments("a (quiet) street", &[("a quiet street", 1.0)]);
    }

    #[test]
    fn single_word_markers() {
        assert_fragments("cat+ dog", &[("cat", 1.1), (" dog", 1.0)]);
        assert_fragments("a blurry--, photo", &[("a ", 1.0), ("blurry", 0.81), (", photo", 1.0)]);
        assert_fragments("sunset+++", &[("sunset", 1.1f32.powi(3))]);
    }

    #[test]
    fn hyphenated_words_stay_literal() {
        assert_fragments("ultra-realistic 8k", &[("ultra-realistic 8k", 1.0)]);
        assert_fragments("a - b", &[("a - b", 1.0)]);
    }

    #[test]
    fn unbalanced_groups_are_literal() {
        assert_fragments("a (red car", &[("a (red car", 1.0)]);
        assert_fragments("a red) car", &[("a red) car", 1.0)]);
        assert_fragments("((cat)+", &[("(", 1.0), ("cat", 1.1)]);
    }

    #[test]
    fn escaped_parentheses_are_literal() {
        assert_fragments(r"\(not a group\)++", &[("(not a group)++", 1.0)]);
    }

    #[test]
    fn colon_without_number_is_text() {
        assert_fragments("(time: noon)+", &[("time: noon", 1.1)]);
    }

    #[test]
    fn deep_nesting_does_not_exhaust_the_stack() {
        let depth = 200_000;
        let prompt = format!("{}cat{}", "(".repeat(depth), ")".repeat(depth));
        assert_fragments(&prompt, &[("cat", 1.0)]);

        let prompt = format!("{}dog{}+", "(".repeat(depth), ")".repeat(depth));
        assert_fragments(&prompt, &[("dog", 1.1)]);
    }

    #[test]
    fn large_unbalanced_prompts_parse_in_linear_time() {
        let start = std::time::Instant::now();

        let opens = "(".repeat(100_000);
        assert_fragments(&opens, &[(opens.as_str(), 1.0)]);

        let closes = ")".repeat(100_000);
        assert_fragments(&closes, &[(closes.as_str(), 1.0)]);

        let colons = "(a:".repeat(50_000);
        assert_fragments(&colons, &[(colons.as_str(), 1.0)]);

        let markers = format!("cat{}x", "+".repeat(100_000));
        assert_fragments(&markers, &[(markers.as_str(), 1.0)]);

        assert!(
            start.elapsed() < std::time::Duration::from_secs(2),
            "took {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn colon_weights_skip_nested_groups() {
        assert_fragments("((a:2) b:3)", &[("a", 6.0), (" b", 3.0)]);
    }
}
