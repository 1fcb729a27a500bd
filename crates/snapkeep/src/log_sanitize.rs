// Stage stderr ends up in logs and error reports; strip anything that could drive a terminal.
const MAX_LINE_CHARS: usize = 2048;

#[derive(Clone, Copy)]
enum Escape {
    Start,
    Csi,
    // OSC / DCS-like strings run until BEL or ESC '\'.
    Str { bel_ends: bool, saw_esc: bool },
}

pub fn sanitize_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut esc: Option<Escape> = None;
    let mut count = 0usize;

    for c in input.chars() {
        if let Some(state) = esc {
            esc = match state {
                Escape::Start => match c {
                    '[' => Some(Escape::Csi),
                    ']' => Some(Escape::Str {
                        bel_ends: true,
                        saw_esc: false,
                    }),
                    'P' | 'X' | '^' | '_' => Some(Escape::Str {
                        bel_ends: false,
                        saw_esc: false,
                    }),
                    _ => None,
                },
                Escape::Csi if ('@'..='~').contains(&c) => None,
                Escape::Csi => Some(Escape::Csi),
                Escape::Str { bel_ends, saw_esc } => {
                    if (bel_ends && c == '\x07') || (saw_esc && c == '\\') {
                        None
                    } else {
                        Some(Escape::Str {
                            bel_ends,
                            saw_esc: c == '\x1b',
                        })
                    }
                }
            };
            continue;
        }

        match c {
            '\x1b' => esc = Some(Escape::Start),
            '\r' | '\n' => {}
            '\t' => {
                out.push(' ');
                count += 1;
            }
            c if c.is_control() || is_bidi_control(c) => {}
            c => {
                out.push(c);
                count += 1;
            }
        }

        if count >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}
