use std::process::Command;

const MAX_LOG_CHARS: usize = 4096;
const REDACTED: &str = "[redacted]";
// Shorter values would shred ordinary words; they never reach argv anyway.
const MIN_SECRET_LEN: usize = 4;

enum EscapeMode {
    Esc,
    Csi,
    Osc,
    OscEsc,
    StTerminated,
    StEsc,
}

pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut esc_mode: Option<EscapeMode> = None;
    let mut char_count = 0usize;

    for c in input.chars() {
        if let Some(mode) = esc_mode.as_ref() {
            esc_mode = match (mode, c) {
                (EscapeMode::Esc, '[') => Some(EscapeMode::Csi),
                (EscapeMode::Esc, ']') => Some(EscapeMode::Osc),
                (EscapeMode::Esc, 'P' | 'X' | '^' | '_') => Some(EscapeMode::StTerminated),
                (EscapeMode::Esc, _) => None,
                (EscapeMode::Csi, c) if ('@'..='~').contains(&c) => None,
                (EscapeMode::Csi, _) => Some(EscapeMode::Csi),
                (EscapeMode::Osc, '\x07') => None,
                (EscapeMode::Osc, '\x1b') => Some(EscapeMode::OscEsc),
                (EscapeMode::Osc, _) => Some(EscapeMode::Osc),
                (EscapeMode::OscEsc, '\\') => None,
                (EscapeMode::OscEsc, '\x1b') => Some(EscapeMode::OscEsc),
                (EscapeMode::OscEsc, _) => Some(EscapeMode::Osc),
                (EscapeMode::StTerminated, '\x1b') => Some(EscapeMode::StEsc),
                (EscapeMode::StTerminated, _) => Some(EscapeMode::StTerminated),
                (EscapeMode::StEsc, '\\') => None,
                (EscapeMode::StEsc, '\x1b') => Some(EscapeMode::StEsc),
                (EscapeMode::StEsc, _) => Some(EscapeMode::StTerminated),
            };
            continue;
        }

        match c {
            '\x1b' => {
                esc_mode = Some(EscapeMode::Esc);
                continue;
            }
            '\r' | '\n' => continue,
            '\t' => out.push(' '),
            c if c.is_control() || is_format_control(c) => continue,
            c => out.push(c),
        }
        char_count += 1;

        if char_count >= MAX_LOG_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }

    out
}

fn is_format_control(c: char) -> bool {
    c == '\u{061C}'
        || c == '\u{200E}'
        || c == '\u{200F}'
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

pub fn redact(line: &str, secrets: &[String]) -> String {
    let mut out = line.to_string();
    for secret in secrets.iter().filter(|s| s.len() >= MIN_SECRET_LEN) {
        if out.contains(secret.as_str()) {
            out = out.replace(secret.as_str(), REDACTED);
        }
    }
    out
}

// `Command`'s Debug output includes its env, which carries the SSH password.
pub fn command_line(cmd: &Command) -> String {
    let mut out = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        let arg = arg.to_string_lossy();
        out.push(' ');
        if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
            out.push_str(&format!("'{}'", arg.replace('\'', "'\\''")));
        } else {
            out.push_str(&arg);
        }
    }
    out
}
