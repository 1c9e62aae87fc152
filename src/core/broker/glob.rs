// src/core/broker/glob.rs

//! Redis-style glob matching for `KEYS` and pattern subscriptions.

/// Matches `string` against a glob pattern supporting `*`, `?`, `[...]`, `[^...]`
/// and `\` escapes. Iterative, so pathological patterns cannot blow the stack.
pub fn glob_match(pattern: &[u8], string: &[u8]) -> bool {
    let mut p_idx = 0;
    let mut s_idx = 0;
    // Resume points recorded at the last `*`.
    let mut star: Option<(usize, usize)> = None;

    while s_idx < string.len() {
        let step = match pattern.get(p_idx) {
            Some(b'?') => Some(1),
            Some(b'*') => {
                star = Some((p_idx + 1, s_idx));
                p_idx += 1;
                continue;
            }
            Some(b'[') => char_set_len(&pattern[p_idx..], string[s_idx]),
            Some(b'\\') if p_idx + 1 < pattern.len() => {
                (pattern[p_idx + 1] == string[s_idx]).then_some(2)
            }
            Some(&c) if c == string[s_idx] => Some(1),
            _ => None,
        };

        match (step, star) {
            (Some(len), _) => {
                p_idx += len;
                s_idx += 1;
            }
            (None, Some((star_p, star_s))) => {
                p_idx = star_p;
                s_idx = star_s + 1;
                star = Some((star_p, star_s + 1));
            }
            (None, None) => return false,
        }
    }

    while pattern.get(p_idx) == Some(&b'*') {
        p_idx += 1;
    }
    p_idx == pattern.len()
}

/// If the `[...]` set at the start of `segment` matches `c`, returns the set's length.
fn char_set_len(segment: &[u8], c: u8) -> Option<usize> {
    if segment.len() < 3 {
        return None;
    }

    let mut idx = 1;
    let negated = segment.get(idx) == Some(&b'^');
    if negated {
        idx += 1;
    }

    let mut matched = false;
    while idx < segment.len() && segment[idx] != b']' {
        let first = segment[idx];
        if idx + 2 < segment.len() && segment[idx + 1] == b'-' && segment[idx + 2] != b']' {
            matched |= (first..=segment[idx + 2]).contains(&c);
            idx += 3;
        } else {
            matched |= first == c;
            idx += 1;
        }
    }

    (idx < segment.len() && matched != negated).then_some(idx + 1)
}
