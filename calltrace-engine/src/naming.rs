//! 関数名の正規化
//!
//! 完全修飾名（ハッシュ接尾辞付きのこともある）から、重複排除と
//! 親探索のキーとなる短い「ベース名」を求めます。パーサではなく
//! ヒューリスティックで、崩れた名前は最も右のセグメントに退化します。

/// 名前空間の区切り
pub const SEPARATOR: &str = "::";

/// 名前を `::` で分割する
///
/// `<...>` の内側にある区切りは数えない。空のセグメントは捨てる。
pub fn split_path(name: &str) -> Vec<&str> {
    let bytes = name.as_bytes();
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'<' => depth += 1,
            // `->` の `>` は括弧ではない
            b'>' if i == 0 || bytes[i - 1] != b'-' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                segments.push(&name[start..i]);
                i += 2;
                start = i;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    segments.push(&name[start..]);

    segments.retain(|s| !s.is_empty());
    segments
}

/// 最後のパスセグメント（`alloc::string::String` → `String`）
pub fn last_segment(name: &str) -> &str {
    split_path(name.trim()).last().copied().unwrap_or("")
}

/// `head<A, B>` のジェネリック引数を深さ0のカンマで分ける
///
/// `Vec<u8, alloc::alloc::Global>` と `"Vec"` なら `["u8", "alloc::alloc::Global"]`。
pub fn generic_args<'a>(segment: &'a str, head: &str) -> Option<Vec<&'a str>> {
    let inner = segment.strip_prefix(head)?.strip_prefix('<')?.strip_suffix('>')?;
    let bytes = inner.as_bytes();
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'<' | b'(' | b'[' => depth += 1,
            b'>' if i > 0 && bytes[i - 1] == b'-' => {}
            b'>' | b')' | b']' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                args.push(inner[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    args.push(inner[start..].trim());
    Some(args)
}

/// `h` + 16進数だけからなるセグメントか（コンパイラが付けるハッシュ）
fn is_hash_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    chars.next() == Some('h')
        && segment.len() > 1
        && chars.all(|c| c.is_ascii_hexdigit())
}

/// 末尾のハッシュ接尾辞を1つ取り除く
pub fn strip_hash_suffix(name: &str) -> &str {
    match name.rfind(SEPARATOR) {
        Some(pos) if is_hash_segment(&name[pos + SEPARATOR.len()..]) => &name[..pos],
        _ => name,
    }
}

/// モジュール名・クレート名らしいセグメントか
fn looks_like_module(segment: &str) -> bool {
    segment.contains('_') || !segment.chars().any(|c| c.is_uppercase())
}

/// 先頭が大文字で始まるか（型名らしいか）
fn starts_uppercase(segment: &str) -> bool {
    segment.chars().next().is_some_and(|c| c.is_uppercase())
}

/// ベース名を求める
///
/// # Examples
/// ```
/// use calltrace_engine::naming::base_name;
/// assert_eq!(base_name("mycrate::foo::h1a2b3c4d5e6f7890"), "foo");
/// assert_eq!(base_name("mycrate::Widget::update::h00"), "Widget::update");
/// ```
pub fn base_name(name: &str) -> String {
    let stripped = strip_hash_suffix(name);
    let segments = split_path(stripped);

    match segments.as_slice() {
        [] => stripped.to_string(),
        [only] => only.to_string(),
        [left, right] => {
            if looks_like_module(left) {
                right.to_string()
            } else {
                format!("{}::{}", left, right)
            }
        }
        [.., owner, last] => {
            if starts_uppercase(owner) {
                format!("{}::{}", owner, last)
            } else {
                last.to_string()
            }
        }
    }
}

/// 型や修飾パスの先頭のパスセグメント
fn leading_path(text: &str) -> &str {
    let mut text = text.trim_start_matches(['&', '*', ' ']);
    for keyword in ["mut ", "const ", "dyn ", "impl "] {
        text = text.strip_prefix(keyword).unwrap_or(text);
    }
    let end = text
        .find(|c: char| c == ':' || c == '<' || c == '>' || c == ' ')
        .unwrap_or(text.len());
    &text[..end]
}

/// `T as Trait` を山括弧の深さ0にある ` as ` で分ける
fn split_qualified(inner: &str) -> (&str, Option<&str>) {
    let bytes = inner.as_bytes();
    let mut depth = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'<' => depth += 1,
            b'>' if i == 0 || bytes[i - 1] != b'-' => depth = depth.saturating_sub(1),
            b' ' if depth == 0 && inner[i..].starts_with(" as ") => {
                return (&inner[..i], Some(&inner[i + 4..]));
            }
            _ => {}
        }
    }
    (inner, None)
}

/// 名前空間の先頭セグメント（モジュール所属の判定に使う）
///
/// `<alloc::vec::Vec<T> as core::ops::Drop>::drop` のような修飾付きの
/// 名前では、山括弧の内側の先頭パスを返す。`<u32 as core::iter::Sum>::sum`
/// のように自身の型がパスを持たない（基本型・スライスなど）ときは、
/// トレイトのパスを使う。
pub fn namespace_prefix(name: &str) -> &str {
    let stripped = strip_hash_suffix(name);
    let first = split_path(stripped).into_iter().next().unwrap_or(stripped);

    let Some(inner) = first.strip_prefix('<') else {
        return first;
    };
    let inner = inner.strip_suffix('>').unwrap_or(inner);
    let (self_type, trait_path) = split_qualified(inner);
    match trait_path {
        Some(trait_path) if !self_type.contains(SEPARATOR) => leading_path(trait_path),
        _ => leading_path(self_type),
    }
}

/// 名前空間の区切りを含むか
pub fn has_separator(name: &str) -> bool {
    name.contains(SEPARATOR)
}

/// 関数名同士がどちらかの方向で部分一致するか
///
/// 記録された関数名のハッシュ接尾辞を取り除いた形でも比較する。
pub fn names_overlap(recorded: &str, reported: &str) -> bool {
    if recorded.is_empty() || reported.is_empty() {
        return false;
    }
    let trimmed = strip_hash_suffix(recorded);
    recorded.contains(reported)
        || reported.contains(recorded)
        || (!trimmed.is_empty() && (trimmed.contains(reported) || reported.contains(trimmed)))
}
