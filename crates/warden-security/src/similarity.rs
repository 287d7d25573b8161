//! Text similarity for near-duplicate detection.

/// Lowercase, replace punctuation with spaces, and collapse whitespace.
pub fn normalize(text: &str) -> String {
    let mapped: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Ratcliff/Obershelp similarity of the normalized texts, in `[0, 1]`.
///
/// `2 * M / T` where `M` is the number of characters covered by recursively
/// matched longest common substrings and `T` the total length of both texts.
/// Two empty texts are identical.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = normalize(a).chars().collect();
    let b: Vec<char> = normalize(b).chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let matched = matching_chars(&a, &b);
    2.0 * matched as f64 / total as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    // Explicit stack instead of recursion; long descriptions can split many times.
    let mut stack = vec![(0usize, a.len(), 0usize, b.len())];
    let mut matched = 0;
    while let Some((a_lo, a_hi, b_lo, b_hi)) = stack.pop() {
        if a_lo >= a_hi || b_lo >= b_hi {
            continue;
        }
        let (i, j, len) = longest_common_substring(&a[a_lo..a_hi], &b[b_lo..b_hi]);
        if len == 0 {
            continue;
        }
        matched += len;
        stack.push((a_lo, a_lo + i, b_lo, b_lo + j));
        stack.push((a_lo + i + len, a_hi, b_lo + j + len, b_hi));
    }
    matched
}

/// Returns `(start_in_a, start_in_b, length)`; earliest match wins ties.
fn longest_common_substring(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb { prev[j] + 1 } else { 0 };
            if curr[j + 1] > best.2 {
                best = (i + 1 - curr[j + 1], j + 1 - curr[j + 1], curr[j + 1]);
            }
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    best
}
