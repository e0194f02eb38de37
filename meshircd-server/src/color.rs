//! mIRC color and formatting control codes.

const BOLD: char = '\x02';
const COLOR: char = '\x03';
const HEX_COLOR: char = '\x04';
const RESET: char = '\x0f';
const MONOSPACE: char = '\x11';
const REVERSE: char = '\x16';
const ITALIC: char = '\x1d';
const STRIKETHROUGH: char = '\x1e';
const UNDERLINE: char = '\x1f';

fn is_format_code(c: char) -> bool {
    matches!(
        c,
        BOLD | COLOR | HEX_COLOR | RESET | MONOSPACE | REVERSE | ITALIC | STRIKETHROUGH | UNDERLINE
    )
}

/// True if `text` carries any color or formatting control code.
pub fn has_color(text: &str) -> bool {
    text.chars().any(is_format_code)
}

/// Remove all formatting codes, including the `fg[,bg]` arguments of color codes.
pub fn strip_color(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            COLOR => skip_color_args(&mut chars, 2, |c| c.is_ascii_digit()),
            HEX_COLOR => skip_color_args(&mut chars, 6, |c| c.is_ascii_hexdigit()),
            c if is_format_code(c) => {}
            c => out.push(c),
        }
    }
    out
}

/// Consume `fg[,bg]` where each part is up to `width` characters matching `accept`.
/// A comma is only consumed when a foreground was present and a background follows.
fn skip_color_args(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    width: usize,
    accept: impl Fn(char) -> bool,
) {
    let fg = skip_run(chars, width, &accept);
    if fg == 0 || chars.peek() != Some(&',') {
        return;
    }
    let mut lookahead = chars.clone();
    lookahead.next();
    if lookahead.peek().is_some_and(|c| accept(*c)) {
        chars.next();
        skip_run(chars, width, &accept);
    }
}

fn skip_run(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    width: usize,
    accept: &impl Fn(char) -> bool,
) -> usize {
    let mut taken = 0;
    while taken < width && chars.peek().is_some_and(|c| accept(*c)) {
        chars.next();
        taken += 1;
    }
    taken
}
