// ─── Version ordering ───
// Publishers do not agree on a version scheme ("8.26", "GE-Proton9-1",
// "v2.3.1-rc1"), so versions are compared segment by segment: digit runs
// numerically, letter runs case-insensitively. A pre-release tag after an
// otherwise equal prefix sorts below the bare release.

use std::cmp::Ordering;

const PRERELEASE_TAGS: &[&str] = &[
    "a", "alpha", "b", "beta", "dev", "pre", "preview", "rc", "snapshot",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Number(u64),
    Text(String),
}

fn segments(raw: &str) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_digits = false;

    let flush = |buf: &mut String, digits: bool, out: &mut Vec<Segment>| {
        if buf.is_empty() {
            return;
        }
        let seg = if digits {
            buf.parse::<u64>()
                .map(Segment::Number)
                .unwrap_or_else(|_| Segment::Text(buf.clone()))
        } else {
            Segment::Text(buf.to_ascii_lowercase())
        };
        out.push(seg);
        buf.clear();
    };

    for c in raw.trim().trim_start_matches(['v', 'V']).chars() {
        if !c.is_ascii_alphanumeric() {
            flush(&mut current, in_digits, &mut out);
            continue;
        }
        let digit = c.is_ascii_digit();
        if !current.is_empty() && digit != in_digits {
            flush(&mut current, in_digits, &mut out);
        }
        in_digits = digit;
        current.push(c);
    }
    flush(&mut current, in_digits, &mut out);
    out
}

/// Total order over loosely formatted version strings.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let (l, r) = (segments(left), segments(right));
    for (a, b) in l.iter().zip(r.iter()) {
        let ord = match (a, b) {
            (Segment::Number(x), Segment::Number(y)) => x.cmp(y),
            (Segment::Text(x), Segment::Text(y)) => x.cmp(y),
            (Segment::Number(_), Segment::Text(_)) => Ordering::Greater,
            (Segment::Text(_), Segment::Number(_)) => Ordering::Less,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    let shared = l.len().min(r.len());
    match (l.get(shared), r.get(shared)) {
        (Some(extra), None) => tail_order(extra),
        (None, Some(extra)) => tail_order(extra).reverse(),
        _ => Ordering::Equal,
    }
}

/// How a version with `extra` appended compares to the version without it.
fn tail_order(extra: &Segment) -> Ordering {
    match extra {
        Segment::Text(tag) if PRERELEASE_TAGS.contains(&tag.as_str()) => Ordering::Less,
        _ => Ordering::Greater,
    }
}

/// True for a version carrying a pre-release tag (`9.0-rc1`, `2.1beta`).
pub fn is_prerelease(raw: &str) -> bool {
    segments(raw)
        .iter()
        .any(|s| matches!(s, Segment::Text(tag) if PRERELEASE_TAGS.contains(&tag.as_str())))
}

/// Same published version string. Only surrounding whitespace and a
/// leading `v` are ignored, so `1.02` and `1.2` differ.
pub fn versions_equal(left: &str, right: &str) -> bool {
    let plain = |raw: &str| {
        let raw = raw.trim();
        raw.strip_prefix(['v', 'V']).unwrap_or(raw).to_string()
    };
    plain(left) == plain(right)
}
