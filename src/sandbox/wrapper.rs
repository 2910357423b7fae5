//! Source preprocessing.
//!
//! Submitted text is rewritten so that it always evaluates as a script and
//! surfaces its errors. Every decision is made on a *masked* copy of the
//! source in which string, template and regex literal contents and comments
//! are blanked out (byte offsets are preserved), so keywords inside literals
//! never influence wrapping.

use std::sync::LazyLock;

use regex::Regex;

/// Global the harness defines as the "returned nothing" sentinel.
pub const VOID_SENTINEL: &str = "__sandboxVoid";

const CAUGHT: &str = "__sandboxError";

static FUNCTION_HEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(async\s+)?(function\b|\([^)]*\)\s*=>|[A-Za-z_$][\w$]*\s*=>)")
        .expect("valid function head pattern")
});

static TRY_CATCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\btry\s*\{[\s\S]*\bcatch\b").expect("valid try pattern"));

static MODULE_STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^[ \t]*(?:import[ \t]*[{*"']|import[ \t]+[\w$]|export[ \t]*[{*]|export[ \t]+[\w$])|\bimport\.meta\b"#,
    )
    .expect("valid module pattern")
});

const CONTROL_KEYWORDS: &[&[u8]] = &[b"if", b"for", b"while", b"switch", b"catch", b"with"];

const STATEMENT_KEYWORDS: &[&str] = &[
    "const", "let", "var", "function", "class", "if", "for", "while", "do", "switch", "try",
    "throw", "return", "import", "export", "break", "continue", "else", "catch", "finally",
];

const REGEX_PRECEDING_KEYWORDS: &[&[u8]] = &[
    b"return", b"typeof", b"case", b"do", b"else", b"in", b"of", b"void", b"yield", b"await",
    b"delete", b"instanceof", b"new", b"throw",
];

/// How a source was rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapStrategy {
    /// An invoked function expression that already catches; left as is.
    AlreadyGuarded,
    /// An invoked function expression given an enclosing try/catch.
    GuardedInvocation,
    /// Top-level `return` moved into an invoked function body.
    FunctionBody,
    /// Top-level asynchronous syntax moved into an invoked async function.
    AsyncBody,
    /// A lone object literal parenthesized into a value.
    ObjectLiteral,
    /// Nothing needed.
    Unchanged,
}

/// Output of [`wrap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedSource {
    pub text: String,
    pub strategy: WrapStrategy,
}

/// Rewrite `source` so it evaluates legally as a script.
pub fn wrap(source: &str) -> WrappedSource {
    let masked = mask(source);
    let scan = analyze(&masked);
    let (start, end) = trimmed_bounds(&masked);

    let (text, strategy) = if let Some(is_async) = invocation_shape(&masked[start..end]) {
        if TRY_CATCH.is_match(&String::from_utf8_lossy(&masked)) {
            (source.to_string(), WrapStrategy::AlreadyGuarded)
        } else {
            (guard_invocation(&source[start..end], is_async), WrapStrategy::GuardedInvocation)
        }
    } else if !scan.top_level_returns.is_empty() {
        let body = rewrite_bare_returns(source, &masked, &scan.top_level_returns);
        let head = if scan.top_level_await { "async function" } else { "function" };
        (format!("({head} () {{\n{body}\n}})()"), WrapStrategy::FunctionBody)
    } else if scan.top_level_await || scan.top_level_then {
        (async_body(source, &masked, start, end), WrapStrategy::AsyncBody)
    } else if is_object_literal(&masked[start..end]) {
        (format!("(\n{}\n)", &source[start..end]), WrapStrategy::ObjectLiteral)
    } else {
        (source.to_string(), WrapStrategy::Unchanged)
    };

    tracing::debug!(?strategy, "wrapped source");
    WrappedSource { text, strategy }
}

/// Whether the source needs a full module loader (`import`/`export`
/// statements or `import.meta`). Dynamic `import()` does not count.
pub fn has_module_syntax(source: &str) -> bool {
    let masked = mask(source);
    MODULE_STATEMENT.is_match(&String::from_utf8_lossy(&masked))
}

fn guard_invocation(invocation: &str, is_async: bool) -> String {
    let invocation = invocation.trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if is_async {
        format!(
            "(async () => {{\ntry {{\nreturn await (\n{invocation}\n);\n}} catch ({CAUGHT}) {{\nthrow {CAUGHT};\n}}\n}})()"
        )
    } else {
        format!(
            "(() => {{\ntry {{\nreturn (\n{invocation}\n);\n}} catch ({CAUGHT}) {{\nthrow {CAUGHT};\n}}\n}})()"
        )
    }
}

fn async_body(source: &str, masked: &[u8], start: usize, end: usize) -> String {
    let split = last_statement_start(masked, start, end);
    let last = String::from_utf8_lossy(&masked[split..end]);
    let last = last.trim_start();
    let returns_last = !last.is_empty() && !starts_with_statement_keyword(last) && !last.starts_with('{');

    let body = if returns_last {
        let split = split + (masked[split..end].len() - last.len());
        format!(
            "{}\nreturn (\n{}\n);",
            &source[..split],
            &source[split..end]
        )
    } else {
        source.to_string()
    };

    format!("(async () => {{\ntry {{\n{body}\n}} catch ({CAUGHT}) {{\nthrow {CAUGHT};\n}}\n}})()")
}

fn starts_with_statement_keyword(text: &str) -> bool {
    let word: String = text
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '$')
        .collect();
    if word == "async" {
        return text[word.len()..].trim_start().starts_with("function");
    }
    STATEMENT_KEYWORDS.contains(&word.as_str())
}

fn rewrite_bare_returns(source: &str, masked: &[u8], returns: &[usize]) -> String {
    let mut out = String::with_capacity(source.len() + returns.len() * VOID_SENTINEL.len());
    let mut copied = 0;
    for &offset in returns {
        let after = offset + "return".len();
        if is_bare_return(masked, after) {
            out.push_str(&source[copied..after]);
            out.push(' ');
            out.push_str(VOID_SENTINEL);
            copied = after;
        }
    }
    out.push_str(&source[copied..]);
    out
}

fn is_bare_return(masked: &[u8], after: usize) -> bool {
    let next = masked[after..]
        .iter()
        .find(|b| **b != b' ' && **b != b'\t' && **b != b'\r');
    matches!(next, None | Some(b';') | Some(b'\n') | Some(b'}'))
}

// ---------------------------------------------------------------------------
// Masking
// ---------------------------------------------------------------------------

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

fn blank(out: &mut [u8], from: usize, to: usize) {
    let end = to.min(out.len());
    if from >= end {
        return;
    }
    for b in &mut out[from..end] {
        if *b != b'\n' {
            *b = b' ';
        }
    }
}

/// Blank literal contents and comments, keeping offsets and newlines.
pub(crate) fn mask(source: &str) -> Vec<u8> {
    let src = source.as_bytes();
    let len = src.len();
    let mut out = src.to_vec();
    let mut depth = 0usize;
    // Brace depths at which an open template substitution resumes its template.
    let mut templates: Vec<usize> = Vec::new();
    let mut last_sig: Option<usize> = None;
    let mut i = 0;

    while i < len {
        let b = src[i];
        let next = src.get(i + 1).copied();
        match b {
            b'/' if next == Some(b'/') => {
                let end = src[i..].iter().position(|c| *c == b'\n').map_or(len, |p| i + p);
                blank(&mut out, i, end);
                i = end;
            }
            b'/' if next == Some(b'*') => {
                let end = src[i + 2..]
                    .windows(2)
                    .position(|w| w == b"*/")
                    .map_or(len, |p| i + 2 + p + 2);
                blank(&mut out, i, end);
                i = end;
            }
            b'/' if regex_allowed(src, last_sig) => {
                let (close, end) = skip_regex(src, i);
                blank(&mut out, i + 1, close);
                last_sig = Some(end.saturating_sub(1));
                i = end;
            }
            b'\'' | b'"' => {
                let (content_end, end) = skip_quoted(src, i, b);
                blank(&mut out, i + 1, content_end);
                last_sig = Some(end.saturating_sub(1));
                i = end;
            }
            b'`' => {
                let (end, opened) = scan_template(src, &mut out, i + 1);
                if opened {
                    depth += 1;
                    templates.push(depth);
                }
                last_sig = Some(end.saturating_sub(1));
                i = end;
            }
            b'{' => {
                depth += 1;
                last_sig = Some(i);
                i += 1;
            }
            b'}' => {
                if templates.last() == Some(&depth) {
                    templates.pop();
                    depth -= 1;
                    let (end, opened) = scan_template(src, &mut out, i + 1);
                    if opened {
                        depth += 1;
                        templates.push(depth);
                    }
                    last_sig = Some(end.saturating_sub(1));
                    i = end;
                } else {
                    depth = depth.saturating_sub(1);
                    last_sig = Some(i);
                    i += 1;
                }
            }
            c if c.is_ascii_whitespace() => i += 1,
            _ => {
                last_sig = Some(i);
                i += 1;
            }
        }
    }
    out
}

fn regex_allowed(src: &[u8], last_sig: Option<usize>) -> bool {
    let Some(pos) = last_sig else {
        return true;
    };
    let b = src[pos];
    if is_ident_byte(b) {
        let start = src[..=pos]
            .iter()
            .rposition(|c| !is_ident_byte(*c))
            .map_or(0, |p| p + 1);
        return REGEX_PRECEDING_KEYWORDS.contains(&&src[start..=pos]);
    }
    !matches!(b, b')' | b']' | b'}' | b'"' | b'\'' | b'`')
}

/// Returns (index of the closing slash, index after the flags).
fn skip_regex(src: &[u8], start: usize) -> (usize, usize) {
    let mut j = start + 1;
    let mut in_class = false;
    while j < src.len() {
        match src[j] {
            b'\\' => j += 2,
            b'[' => {
                in_class = true;
                j += 1;
            }
            b']' => {
                in_class = false;
                j += 1;
            }
            b'/' if !in_class => break,
            b'\n' => return (j, j),
            _ => j += 1,
        }
    }
    let close = j.min(src.len());
    let mut end = (close + 1).min(src.len());
    while end < src.len() && is_ident_byte(src[end]) {
        end += 1;
    }
    (close, end)
}

/// Returns (end of contents, index after the closing quote).
fn skip_quoted(src: &[u8], start: usize, quote: u8) -> (usize, usize) {
    let mut i = start + 1;
    while i < src.len() {
        match src[i] {
            b'\\' => i += 2,
            b'\n' => return (i, i),
            c if c == quote => return (i, i + 1),
            _ => i += 1,
        }
    }
    (src.len(), src.len())
}

/// Blank template text from `i`; stops after the closing backtick or after
/// an opening `${`. Returns (resume index, substitution opened).
fn scan_template(src: &[u8], out: &mut [u8], mut i: usize) -> (usize, bool) {
    while i < src.len() {
        match src[i] {
            b'\\' => {
                blank(out, i, i + 2);
                i += 2;
            }
            b'`' => return (i + 1, false),
            b'$' if src.get(i + 1) == Some(&b'{') => return (i + 2, true),
            b'\n' => i += 1,
            _ => {
                out[i] = b' ';
                i += 1;
            }
        }
    }
    (src.len(), false)
}

// ---------------------------------------------------------------------------
// Scope analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Scan {
    top_level_returns: Vec<usize>,
    top_level_await: bool,
    top_level_then: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Function,
    Block,
    Paren { control: bool },
    Bracket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prev {
    Start,
    Word { control: bool },
    Arrow,
    CloseParen { control: bool },
    Punct(u8),
}

fn analyze(masked: &[u8]) -> Scan {
    let mut scan = Scan::default();
    let mut frames: Vec<Frame> = Vec::new();
    let mut prev = Prev::Start;
    let mut pending_class = false;
    let mut i = 0;

    while i < masked.len() {
        let b = masked[i];
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if is_ident_byte(b) {
            let start = i;
            while i < masked.len() && is_ident_byte(masked[i]) {
                i += 1;
            }
            let word = &masked[start..i];
            let in_function = frames.contains(&Frame::Function);
            if prev == Prev::Punct(b'.') {
                if word == b"then" && !in_function && next_significant(masked, i) == Some(b'(') {
                    scan.top_level_then = true;
                }
            } else {
                match word {
                    b"return" if !in_function => scan.top_level_returns.push(start),
                    b"await" if !in_function => scan.top_level_await = true,
                    b"class" => pending_class = true,
                    _ => {}
                }
            }
            prev = Prev::Word {
                control: CONTROL_KEYWORDS.contains(&word),
            };
            continue;
        }
        match b {
            b'(' => {
                let control = matches!(prev, Prev::Word { control: true });
                frames.push(Frame::Paren { control });
                prev = Prev::Punct(b);
            }
            b')' => {
                let mut control = false;
                while let Some(frame) = frames.pop() {
                    if let Frame::Paren { control: c } = frame {
                        control = c;
                        break;
                    }
                }
                prev = Prev::CloseParen { control };
            }
            b'[' => {
                frames.push(Frame::Bracket);
                prev = Prev::Punct(b);
            }
            b']' => {
                while let Some(frame) = frames.pop() {
                    if frame == Frame::Bracket {
                        break;
                    }
                }
                prev = Prev::Punct(b);
            }
            b'{' => {
                let frame = if pending_class {
                    pending_class = false;
                    Frame::Block
                } else {
                    match prev {
                        Prev::Arrow | Prev::CloseParen { control: false } => Frame::Function,
                        _ => Frame::Block,
                    }
                };
                frames.push(frame);
                prev = Prev::Punct(b);
            }
            b'}' => {
                while let Some(frame) = frames.pop() {
                    if matches!(frame, Frame::Function | Frame::Block) {
                        break;
                    }
                }
                prev = Prev::Punct(b);
            }
            b'=' if masked.get(i + 1) == Some(&b'>') => {
                prev = Prev::Arrow;
                i += 2;
                continue;
            }
            _ => prev = Prev::Punct(b),
        }
        i += 1;
    }
    scan
}

fn next_significant(masked: &[u8], from: usize) -> Option<u8> {
    masked[from..]
        .iter()
        .copied()
        .find(|b| !b.is_ascii_whitespace())
}

fn prev_significant(masked: &[u8], before: usize) -> Option<u8> {
    masked[..before]
        .iter()
        .rev()
        .copied()
        .find(|b| !b.is_ascii_whitespace())
}

/// Bounds of the source without surrounding whitespace and trailing `;`.
fn trimmed_bounds(masked: &[u8]) -> (usize, usize) {
    let start = masked
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(masked.len());
    let end = masked
        .iter()
        .rposition(|b| !b.is_ascii_whitespace() && *b != b';')
        .map_or(start, |p| p + 1)
        .max(start);
    (start, end)
}

fn matching_close(text: &[u8], open_at: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, b) in text.iter().enumerate().skip(open_at) {
        match b {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// `Some(is_async)` when the text is `(function…)(…)` or `(… => …)(…)`.
fn invocation_shape(text: &[u8]) -> Option<bool> {
    if text.first() != Some(&b'(') {
        return None;
    }
    let close = matching_close(text, 0)?;
    let rest = &text[close + 1..];
    let call_start = rest.iter().position(|b| !b.is_ascii_whitespace())?;
    let call = &rest[call_start..];
    if call.first() != Some(&b'(') || matching_close(call, 0)? != call.len() - 1 {
        return None;
    }
    let callee = String::from_utf8_lossy(&text[1..close]);
    let head = FUNCTION_HEAD.captures(&callee)?;
    Some(head.get(1).is_some())
}

fn is_object_literal(text: &[u8]) -> bool {
    if text.first() != Some(&b'{') || matching_close(text, 0) != Some(text.len() - 1) {
        return false;
    }
    let inner = &text[1..text.len() - 1];
    let Some(first) = inner.iter().position(|b| !b.is_ascii_whitespace()) else {
        return true;
    };
    if has_top_level_semicolon(inner) {
        return false;
    }
    let member = &inner[first..];

    if member.starts_with(b"...") || member.first() == Some(&b'*') {
        return true;
    }
    let key_end = match member[0] {
        b'[' => match matching_close(member, 0) {
            Some(close) => close + 1,
            None => return false,
        },
        b'"' | b'\'' => match member[1..].iter().position(|b| *b == member[0]) {
            Some(p) => p + 2,
            None => return false,
        },
        b if is_ident_byte(b) => member.iter().position(|b| !is_ident_byte(*b)).unwrap_or(member.len()),
        _ => return false,
    };
    let key = &member[..key_end];
    let after = &member[key_end..];
    let Some(next_at) = after.iter().position(|b| !b.is_ascii_whitespace()) else {
        // `{ name }` shorthand.
        return is_ident_byte(key[0]) && !STATEMENT_KEYWORDS.contains(&String::from_utf8_lossy(key).as_ref());
    };
    match after[next_at] {
        b':' | b',' => true,
        b'(' => {
            let params = &after[next_at..];
            matching_close(params, 0)
                .and_then(|close| next_significant(params, close + 1))
                == Some(b'{')
        }
        b if is_ident_byte(b) => matches!(key, b"get" | b"set" | b"async"),
        _ => false,
    }
}

fn has_top_level_semicolon(inner: &[u8]) -> bool {
    let mut depth = 0i32;
    for b in inner {
        match b {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b';' if depth == 0 => return true,
            _ => {}
        }
    }
    false
}

fn is_continuation(b: u8) -> bool {
    matches!(
        b,
        b'.' | b',' | b')' | b']' | b';' | b'?' | b':' | b'=' | b'+' | b'-' | b'*' | b'/' | b'%'
            | b'&' | b'|' | b'^' | b'<' | b'>' | b'(' | b'[' | b'`'
    )
}

fn is_operator_tail(b: u8) -> bool {
    matches!(
        b,
        b'=' | b'+' | b'-' | b'*' | b'/' | b'%' | b'&' | b'|' | b'^' | b'<' | b'>' | b'!' | b'?'
            | b':' | b',' | b'.' | b'(' | b'[' | b'{'
    )
}

/// Offset where the last top-level statement in `start..end` begins.
fn last_statement_start(masked: &[u8], start: usize, end: usize) -> usize {
    let mut depth = 0i32;
    let mut split = start;
    for i in start..end {
        match masked[i] {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' => depth -= 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let next = masked[i + 1..end].iter().copied().find(|b| !b.is_ascii_whitespace());
                    if next.map_or(true, |b| !is_continuation(b)) {
                        split = i + 1;
                    }
                }
            }
            b';' if depth == 0 => split = i + 1,
            b'\n' if depth == 0 => {
                let before = prev_significant(&masked[..end], i);
                let after = masked[i + 1..end].iter().copied().find(|b| !b.is_ascii_whitespace());
                let continues = before.map_or(true, is_operator_tail) || after.map_or(true, is_continuation);
                if !continues {
                    split = i + 1;
                }
            }
            _ => {}
        }
    }
    split
}
