//! Terminal output rendering
//!
//! Converts raw PTY/tmux output (with ANSI escape sequences) into HTML that
//! the UI can insert directly: text is escaped, SGR styling becomes
//! `<span style="...">`, everything else is dropped. Every function here is
//! total; malformed or truncated sequences are discarded, never panicked on.

use std::iter::Peekable;
use std::str::Chars;

const ESC: char = '\u{1b}';
const BEL: char = '\u{7}';

const NORMAL_COLORS: [&str; 8] = [
    "#000000", "#cd3131", "#0dbc79", "#e5e510", "#2472c8", "#bc3fbc", "#11a8cd", "#e5e5e5",
];
const BRIGHT_COLORS: [&str; 8] = [
    "#666666", "#f14c4c", "#23d18b", "#f5f543", "#3b8eea", "#d670d6", "#29b8db", "#ffffff",
];
const CUBE_LEVELS: [u8; 6] = [0, 95, 135, 175, 215, 255];

/// Render terminal output as display-safe HTML markup.
///
/// A reset (`ESC[0m` or `ESC[m`) closes every open span; spans still open
/// at the end of input are closed, so opened and closed spans always match.
pub fn to_display_markup(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + raw.len() / 8);
    let mut open_spans = 0usize;

    scan(raw, |piece| match piece {
        Piece::Text(c) => push_escaped(&mut out, c),
        Piece::Sgr(params) => apply_sgr(params, &mut out, &mut open_spans),
    });

    close_spans(&mut out, &mut open_spans);
    out
}

/// Same as [`to_display_markup`] for raw bytes (decoded lossily).
pub fn to_display_markup_bytes(raw: &[u8]) -> String {
    to_display_markup(&String::from_utf8_lossy(raw))
}

/// Remove escape sequences and carriage returns, keeping plain text.
pub fn strip_escapes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    scan(raw, |piece| {
        if let Piece::Text(c) = piece {
            out.push(c);
        }
    });
    out
}

enum Piece<'a> {
    Text(char),
    Sgr(&'a str),
}

/// Walk the input, handing printable characters and SGR parameter strings
/// to `on_piece` in order. Other sequences are consumed silently.
fn scan<F>(raw: &str, mut on_piece: F)
where
    F: FnMut(Piece<'_>),
{
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ESC => match chars.peek().copied() {
                Some('[') => {
                    chars.next();
                    let (params, final_char) = read_csi(&mut chars);
                    if final_char == Some('m') && !is_private(&params) {
                        on_piece(Piece::Sgr(&params));
                    }
                }
                Some(']') => {
                    chars.next();
                    skip_osc(&mut chars);
                }
                Some('(') | Some(')') | Some('*') | Some('+') => {
                    // Charset designation: ESC ( B
                    chars.next();
                    chars.next();
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            },
            '\r' => {}
            '\n' | '\t' => on_piece(Piece::Text(c)),
            c if c.is_control() => {}
            c => on_piece(Piece::Text(c)),
        }
    }
}

/// Read CSI parameters up to the final byte. Returns `None` as the final
/// character when the sequence is cut short.
fn read_csi(chars: &mut Peekable<Chars<'_>>) -> (String, Option<char>) {
    let mut params = String::new();

    while let Some(&c) = chars.peek() {
        match c {
            '\u{20}'..='\u{3f}' => {
                params.push(c);
                chars.next();
            }
            '\u{40}'..='\u{7e}' => {
                chars.next();
                return (params, Some(c));
            }
            // Anything else ends a malformed sequence; leave it for the caller.
            _ => return (params, None),
        }
    }

    (params, None)
}

/// Skip an OSC string terminated by BEL or ST (`ESC \`).
fn skip_osc(chars: &mut Peekable<Chars<'_>>) {
    while let Some(c) = chars.next() {
        if c == BEL {
            return;
        }
        if c == ESC {
            if chars.peek() == Some(&'\\') {
                chars.next();
            }
            return;
        }
    }
}

fn is_private(params: &str) -> bool {
    params.starts_with(['?', '<', '=', '>'])
}

fn push_escaped(out: &mut String, c: char) {
    match c {
        '&' => out.push_str("&amp;"),
        '<' => out.push_str("&lt;"),
        '>' => out.push_str("&gt;"),
        '"' => out.push_str("&quot;"),
        '\'' => out.push_str("&#39;"),
        c => out.push(c),
    }
}

fn close_spans(out: &mut String, open_spans: &mut usize) {
    for _ in 0..*open_spans {
        out.push_str("</span>");
    }
    *open_spans = 0;
}

/// Translate one SGR parameter list into span open/close markup
fn apply_sgr(params: &str, out: &mut String, open_spans: &mut usize) {
    let codes: Vec<u32> = params
        .split([';', ':'])
        .map(|p| if p.is_empty() { 0 } else { p.parse().unwrap_or(u32::MAX) })
        .collect();

    let mut styles: Vec<String> = Vec::new();
    let mut i = 0;

    while i < codes.len() {
        let code = codes[i];
        match code {
            0 => {
                styles.clear();
                close_spans(out, open_spans);
            }
            1 => styles.push("font-weight:bold".to_string()),
            2 => styles.push("opacity:0.7".to_string()),
            3 => styles.push("font-style:italic".to_string()),
            4 => styles.push("text-decoration:underline".to_string()),
            9 => styles.push("text-decoration:line-through".to_string()),
            30..=37 => styles.push(format!("color:{}", NORMAL_COLORS[(code - 30) as usize])),
            40..=47 => styles.push(format!(
                "background-color:{}",
                NORMAL_COLORS[(code - 40) as usize]
            )),
            90..=97 => styles.push(format!("color:{}", BRIGHT_COLORS[(code - 90) as usize])),
            100..=107 => styles.push(format!(
                "background-color:{}",
                BRIGHT_COLORS[(code - 100) as usize]
            )),
            38 | 48 => {
                let property = if code == 38 { "color" } else { "background-color" };
                match extended_color(&codes[i + 1..]) {
                    Some((color, consumed)) => {
                        styles.push(format!("{}:{}", property, color));
                        i += consumed;
                    }
                    // Malformed extended color: nothing after it is reliable.
                    None => break,
                }
            }
            _ => {}
        }
        i += 1;
    }

    if !styles.is_empty() {
        out.push_str("<span style=\"");
        out.push_str(&styles.join(";"));
        out.push_str("\">");
        *open_spans += 1;
    }
}

/// Parse `5;n` or `2;r;g;b` following a 38/48 code.
/// Returns the CSS color and how many parameters were consumed.
fn extended_color(rest: &[u32]) -> Option<(String, usize)> {
    match rest {
        [5, n, ..] if *n <= 255 => Some((palette_256(*n as u8), 2)),
        [2, r, g, b, ..] if *r <= 255 && *g <= 255 && *b <= 255 => {
            Some((format!("#{:02x}{:02x}{:02x}", r, g, b), 4))
        }
        _ => None,
    }
}

fn palette_256(n: u8) -> String {
    match n {
        0..=7 => NORMAL_COLORS[n as usize].to_string(),
        8..=15 => BRIGHT_COLORS[(n - 8) as usize].to_string(),
        16..=231 => {
            let index = n - 16;
            let r = CUBE_LEVELS[(index / 36) as usize];
            let g = CUBE_LEVELS[((index % 36) / 6) as usize];
            let b = CUBE_LEVELS[(index % 6) as usize];
            format!("#{:02x}{:02x}{:02x}", r, g, b)
        }
        232..=255 => {
            let level = 8 + 10 * (n - 232);
            format!("#{:02x}{:02x}{:02x}", level, level, level)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span_balance(html: &str) -> (usize, usize) {
        (html.matches("<span").count(), html.matches("</span>").count())
    }

    #[test]
    fn test_plain_text_is_escaped() {
        assert_eq!(
            to_display_markup("<b>a & b</b>"),
            "&lt;b&gt;a &amp; b&lt;/b&gt;"
        );
    }

    #[test]
    fn test_basic_color_and_reset() {
        let html = to_display_markup("\u{1b}[31merror\u{1b}[0m done");
        assert_eq!(html, "<span style=\"color:#cd3131\">error</span> done");
    }

    #[test]
    fn test_text_and_styles_interleave_in_order() {
        let html = to_display_markup("a\u{1b}[1mb\u{1b}[0m<c\u{1b}[32md");
        assert_eq!(
            html,
            "a<span style=\"font-weight:bold\">b</span>&lt;c<span style=\"color:#0dbc79\">d</span>"
        );
        assert_eq!(strip_escapes("a\u{1b}[1mb\u{1b}[0m<c\u{1b}[32md"), "ab<cd");
    }

    #[test]
    fn test_combined_codes_share_one_span() {
        let html = to_display_markup("\u{1b}[1;32mok\u{1b}[m");
        assert_eq!(
            html,
            "<span style=\"font-weight:bold;color:#0dbc79\">ok</span>"
        );
    }

    #[test]
    fn test_unclosed_span_closed_at_end() {
        let html = to_display_markup("\u{1b}[44mblue background");
        assert!(html.ends_with("</span>"));
        assert_eq!(span_balance(&html), (1, 1));
    }

    #[test]
    fn test_nested_spans_closed_by_reset() {
        let html = to_display_markup("\u{1b}[1mA\u{1b}[33mB\u{1b}[0mC");
        assert_eq!(span_balance(&html), (2, 2));
        assert!(html.ends_with("</span></span>C"));
    }

    #[test]
    fn test_bright_and_extended_colors() {
        let html = to_display_markup("\u{1b}[91mx\u{1b}[38;5;196my\u{1b}[48;2;1;2;3mz");
        assert!(html.contains("color:#f14c4c"));
        assert!(html.contains("color:#ff0000"));
        assert!(html.contains("background-color:#010203"));
        assert_eq!(span_balance(&html), (3, 3));
    }

    #[test]
    fn test_grayscale_palette() {
        assert_eq!(palette_256(232), "#080808");
        assert_eq!(palette_256(255), "#eeeeee");
        assert_eq!(palette_256(16), "#000000");
        assert_eq!(palette_256(9), "#f14c4c");
    }

    #[test]
    fn test_unrecognized_codes_are_dropped() {
        let html = to_display_markup("\u{1b}[5mblink\u{1b}[2Kcleared\u{1b}[?25lcursor");
        assert_eq!(html, "blinkclearedcursor");
    }

    #[test]
    fn test_osc_title_sequence_removed() {
        let html = to_display_markup("\u{1b}]0;user@host: ~\u{7}prompt$ ");
        assert_eq!(html, "prompt$ ");

        let st = to_display_markup("\u{1b}]2;title\u{1b}\\after");
        assert_eq!(st, "after");
    }

    #[test]
    fn test_carriage_returns_dropped() {
        assert_eq!(to_display_markup("a\r\nb\r\n"), "a\nb\n");
    }

    #[test]
    fn test_unterminated_sequences() {
        assert_eq!(to_display_markup("text\u{1b}"), "text");
        assert_eq!(to_display_markup("text\u{1b}[31"), "text");
        assert_eq!(to_display_markup("\u{1b}[38;5mhi"), "hi");
        assert_eq!(to_display_markup("\u{1b}]never ends"), "");
    }

    #[test]
    fn test_malformed_csi_keeps_following_text() {
        let html = to_display_markup("\u{1b}[31\nnext line");
        assert_eq!(html, "\nnext line");
    }

    #[test]
    fn test_huge_parameter_does_not_panic() {
        let html = to_display_markup("\u{1b}[99999999999999999999mx\u{1b}[38;5;999my");
        assert_eq!(html, "xy");
    }

    #[test]
    fn test_strip_escapes() {
        assert_eq!(
            strip_escapes("\u{1b}[1;31mFAIL\u{1b}[0m tests/a.rs\r\n"),
            "FAIL tests/a.rs\n"
        );
    }

    #[test]
    fn test_invalid_utf8_bytes() {
        let html = to_display_markup_bytes(&[0x1b, b'[', b'3', b'2', b'm', 0xff, b'o', b'k']);
        assert!(html.contains("ok"));
        assert_eq!(span_balance(&html), (1, 1));
    }

    #[test]
    fn test_pseudo_random_input_never_unbalanced() {
        // Deterministic LCG so failures are reproducible.
        let alphabet: Vec<char> = "\u{1b}[];m0123456789;?<&\r\n\u{7}\\abc".chars().collect();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;

        for _ in 0..500 {
            let mut input = String::new();
            for _ in 0..64 {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                input.push(alphabet[(seed >> 33) as usize % alphabet.len()]);
            }
            let html = to_display_markup(&input);
            let (opened, closed) = span_balance(&html);
            assert_eq!(opened, closed, "unbalanced for input {:?}", input);
            assert!(!html.contains('\u{1b}'));
        }
    }
}
