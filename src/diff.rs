//! Character diff with a time budget.
//!
//! Greedy Myers diff over chars after trimming the common prefix and suffix.
//! When the budget runs out the differing middle is expressed as one delete
//! followed by one insert, which is still correct, only less compact.

use std::time::{Duration, Instant};

use crate::update::TextOp;

/// One run of a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffRun {
    /// Text present on both sides.
    Equal(String),
    /// Text only in `before`.
    Delete(String),
    /// Text only in `after`.
    Insert(String),
}

/// Diffs `before` into `after`.
pub fn diff_runs(before: &str, after: &str, budget: Duration) -> Vec<DiffRun> {
    let a: Vec<char> = before.chars().collect();
    let b: Vec<char> = after.chars().collect();

    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let a_mid = &a[prefix..a.len() - suffix];
    let b_mid = &b[prefix..b.len() - suffix];

    let mut runs = Vec::new();
    if prefix > 0 {
        runs.push(DiffRun::Equal(a[..prefix].iter().collect()));
    }
    let middle = match (a_mid.is_empty(), b_mid.is_empty()) {
        (true, true) => Vec::new(),
        (true, false) => vec![DiffRun::Insert(b_mid.iter().collect())],
        (false, true) => vec![DiffRun::Delete(a_mid.iter().collect())],
        (false, false) => myers(a_mid, b_mid, Instant::now() + budget).unwrap_or_else(|| {
            vec![
                DiffRun::Delete(a_mid.iter().collect()),
                DiffRun::Insert(b_mid.iter().collect()),
            ]
        }),
    };
    runs.extend(middle);
    if suffix > 0 {
        runs.push(DiffRun::Equal(a[a.len() - suffix..].iter().collect()));
    }
    runs
}

/// Diffs `before` into `after` and expresses the result as position ops
/// relative to the start of `before`, deletes before inserts in each region.
pub fn diff_as_text_ops(before: &str, after: &str, budget: Duration) -> Vec<TextOp> {
    let mut ops = Vec::new();
    let mut position = 0;
    for run in diff_runs(before, after, budget) {
        match run {
            DiffRun::Equal(text) => position += text.chars().count(),
            DiffRun::Delete(d) => ops.push(TextOp::Delete {
                p: position,
                d,
                u: false,
            }),
            DiffRun::Insert(i) => {
                let len = i.chars().count();
                ops.push(TextOp::Insert {
                    p: position,
                    i,
                    u: false,
                });
                position += len;
            }
        }
    }
    ops
}

enum Edit {
    Equal(char),
    Delete(char),
    Insert(char),
}

/// Returns `None` when the deadline passes before the shortest edit script is found.
fn myers(a: &[char], b: &[char], deadline: Instant) -> Option<Vec<DiffRun>> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max = (n + m) as usize;
    let offset = max as isize + 1;
    let mut v = vec![0isize; 2 * max + 3];
    let mut trace: Vec<Vec<isize>> = Vec::new();

    let mut found = None;
    'outer: for d in 0..=max as isize {
        if Instant::now() >= deadline {
            return None;
        }
        let mut k = -d;
        while k <= d {
            let idx = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            if x >= n && y >= m {
                trace.push(v[(offset - d) as usize..=(offset + d) as usize].to_vec());
                found = Some(d);
                break 'outer;
            }
            k += 2;
        }
        trace.push(v[(offset - d) as usize..=(offset + d) as usize].to_vec());
    }
    let depth = found?;

    let mut edits = Vec::new();
    let (mut x, mut y) = (n, m);
    for d in (1..=depth).rev() {
        let prev = &trace[(d - 1) as usize];
        let at = |k: isize| prev[(k + d - 1) as usize];
        let k = x - y;
        let prev_k = if k == -d || (k != d && at(k - 1) < at(k + 1)) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = at(prev_k);
        let prev_y = prev_x - prev_k;
        while x > prev_x && y > prev_y {
            edits.push(Edit::Equal(a[(x - 1) as usize]));
            x -= 1;
            y -= 1;
        }
        if x == prev_x {
            edits.push(Edit::Insert(b[(y - 1) as usize]));
        } else {
            edits.push(Edit::Delete(a[(x - 1) as usize]));
        }
        x = prev_x;
        y = prev_y;
    }
    while x > 0 && y > 0 {
        edits.push(Edit::Equal(a[(x - 1) as usize]));
        x -= 1;
        y -= 1;
    }
    edits.reverse();

    Some(coalesce(edits))
}

fn coalesce(edits: Vec<Edit>) -> Vec<DiffRun> {
    let mut runs = Vec::new();
    let mut equal = String::new();
    let mut deleted = String::new();
    let mut inserted = String::new();

    let flush_changes = |runs: &mut Vec<DiffRun>, deleted: &mut String, inserted: &mut String| {
        if !deleted.is_empty() {
            runs.push(DiffRun::Delete(std::mem::take(deleted)));
        }
        if !inserted.is_empty() {
            runs.push(DiffRun::Insert(std::mem::take(inserted)));
        }
    };

    for edit in edits {
        match edit {
            Edit::Equal(c) => {
                flush_changes(&mut runs, &mut deleted, &mut inserted);
                equal.push(c);
            }
            Edit::Delete(c) => {
                if !equal.is_empty() {
                    runs.push(DiffRun::Equal(std::mem::take(&mut equal)));
                }
                deleted.push(c);
            }
            Edit::Insert(c) => {
                if !equal.is_empty() {
                    runs.push(DiffRun::Equal(std::mem::take(&mut equal)));
                }
                inserted.push(c);
            }
        }
    }
    flush_changes(&mut runs, &mut deleted, &mut inserted);
    if !equal.is_empty() {
        runs.push(DiffRun::Equal(equal));
    }
    runs
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{DiffRun, diff_as_text_ops, diff_runs};
    use crate::update::TextOp;

    const BUDGET: Duration = Duration::from_millis(100);

    fn apply(before: &str, ops: &[TextOp]) -> String {
        let mut chars: Vec<char> = before.chars().collect();
        for op in ops {
            match op {
                TextOp::Insert { p, i, .. } => {
                    let tail = chars.split_off(*p);
                    chars.extend(i.chars());
                    chars.extend(tail);
                }
                TextOp::Delete { p, d, .. } => {
                    chars.drain(*p..*p + d.chars().count());
                }
                _ => {}
            }
        }
        chars.into_iter().collect()
    }

    #[test]
    fn trims_and_diffs_middle() {
        let runs = diff_runs("the quick fox", "the quack fox", BUDGET);
        assert_eq!(
            runs,
            vec![
                DiffRun::Equal("the qu".to_string()),
                DiffRun::Delete("i".to_string()),
                DiffRun::Insert("a".to_string()),
                DiffRun::Equal("ck fox".to_string()),
            ]
        );
    }

    #[test]
    fn ops_reproduce_target() {
        for (before, after) in [
            ("abc", "xbz"),
            ("", "hello"),
            ("hello", ""),
            ("kitten", "sitting"),
            ("ünïcödé text", "unicode téxt"),
        ] {
            let ops = diff_as_text_ops(before, after, BUDGET);
            assert_eq!(apply(before, &ops), after, "{before} -> {after}");
        }
    }

    #[test]
    fn exhausted_budget_falls_back_to_replace() {
        let runs = diff_runs("abcXdef", "abcYdef", Duration::ZERO);
        assert_eq!(
            runs,
            vec![
                DiffRun::Equal("abc".to_string()),
                DiffRun::Delete("X".to_string()),
                DiffRun::Insert("Y".to_string()),
                DiffRun::Equal("def".to_string()),
            ]
        );
    }
}
