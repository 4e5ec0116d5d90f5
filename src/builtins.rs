//! Built-in BASIC functions

use crate::error::ErrorCode;
use crate::format;
use crate::framebuffer::pack_rgb;
use crate::interpreter::{InterpreterState, Value};

/// The closed set of built-in function names the parser and evaluator
/// recognize.
pub fn is_builtin(name: &str) -> bool {
    matches!(
        name.trim_end_matches('$'),
        "ABS" | "SGN" | "INT" | "FIX" | "SQR" | "SIN" | "COS" | "TAN" | "ATN" | "LOG" | "EXP"
            | "RND" | "LEN" | "ASC" | "CHR" | "STR" | "VAL" | "LEFT" | "RIGHT" | "MID"
            | "INSTR" | "STRING" | "SPACE" | "TAB" | "SPC" | "UCASE" | "LCASE" | "LTRIM"
            | "RTRIM" | "HEX" | "OCT" | "CINT" | "CDBL" | "CSNG" | "CLNG" | "CVI" | "CVS"
            | "CVD" | "MKI" | "MKS" | "MKD" | "TIMER" | "INKEY" | "CSRLIN" | "POS" | "POINT"
            | "EOF" | "LOF" | "LOC" | "PEEK" | "FRE" | "ERR" | "ERL" | "INPUT" | "RGB"
            | "DATE" | "TIME"
    )
}

fn num(args: &[Value], at: usize) -> Result<f64, ErrorCode> {
    args.get(at).ok_or(ErrorCode::IllegalFunctionCall)?.as_number()
}

fn text(args: &[Value], at: usize) -> Result<String, ErrorCode> {
    Ok(args
        .get(at)
        .ok_or(ErrorCode::IllegalFunctionCall)?
        .as_text()?
        .to_string())
}

/// Raw byte view of a binary string, as MKx$/CVx see it.
fn bytes_of(s: &str) -> Vec<u8> {
    s.chars().map(|c| c as u32 as u8).collect()
}

fn string_of(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Call a built-in function with pre-evaluated arguments.
pub fn call(
    state: &mut InterpreterState,
    name: &str,
    args: &[Value],
) -> Result<Value, ErrorCode> {
    match name.trim_end_matches('$') {
        // Numeric
        "ABS" => Ok(Value::Number(num(args, 0)?.abs())),
        "SGN" => {
            let n = num(args, 0)?;
            Ok(Value::Number(if n > 0.0 {
                1.0
            } else if n < 0.0 {
                -1.0
            } else {
                0.0
            }))
        }
        "INT" => Ok(Value::Number(num(args, 0)?.floor())),
        "FIX" => Ok(Value::Number(num(args, 0)?.trunc())),
        "SQR" => {
            let n = num(args, 0)?;
            if n < 0.0 {
                Err(ErrorCode::IllegalFunctionCall)
            } else {
                Ok(Value::Number(n.sqrt()))
            }
        }
        "SIN" => Ok(Value::Number(num(args, 0)?.sin())),
        "COS" => Ok(Value::Number(num(args, 0)?.cos())),
        "TAN" => Ok(Value::Number(num(args, 0)?.tan())),
        "ATN" => Ok(Value::Number(num(args, 0)?.atan())),
        "LOG" => {
            let n = num(args, 0)?;
            if n <= 0.0 {
                Err(ErrorCode::IllegalFunctionCall)
            } else {
                Ok(Value::Number(n.ln()))
            }
        }
        "EXP" => Ok(Value::Number(num(args, 0)?.exp())),
        "RND" => {
            let arg = if args.is_empty() { None } else { Some(num(args, 0)?) };
            Ok(Value::Number(state.rnd(arg)))
        }

        // Strings
        "LEN" => Ok(Value::Number(text(args, 0)?.chars().count() as f64)),
        "ASC" => {
            let s = text(args, 0)?;
            match s.chars().next() {
                Some(c) => Ok(Value::Number(c as u32 as f64)),
                None => Err(ErrorCode::IllegalFunctionCall),
            }
        }
        "CHR" => {
            let code = num(args, 0)?.round() as i64;
            if !(0..=255).contains(&code) {
                return Err(ErrorCode::IllegalFunctionCall);
            }
            Ok(Value::Text(cp437_to_unicode(code as u8).to_string()))
        }
        "STR" => Ok(Value::Text(format::str_number(num(args, 0)?))),
        "VAL" => {
            let s = text(args, 0)?;
            Ok(Value::Number(leading_number(&s)))
        }
        "LEFT" => {
            let s = text(args, 0)?;
            let n = num(args, 1)?.round().max(0.0) as usize;
            Ok(Value::Text(s.chars().take(n).collect()))
        }
        "RIGHT" => {
            let s = text(args, 0)?;
            let n = num(args, 1)?.round().max(0.0) as usize;
            let len = s.chars().count();
            Ok(Value::Text(s.chars().skip(len.saturating_sub(n)).collect()))
        }
        "MID" => {
            let s = text(args, 0)?;
            let start = num(args, 1)?.round() as i64;
            if start < 1 {
                return Err(ErrorCode::IllegalFunctionCall);
            }
            let len = if args.len() > 2 {
                num(args, 2)?.round().max(0.0) as usize
            } else {
                usize::MAX
            };
            Ok(Value::Text(
                s.chars().skip(start as usize - 1).take(len).collect(),
            ))
        }
        "INSTR" => {
            let (start, haystack, needle) = if args.len() >= 3 {
                let s = num(args, 0)?.round().max(1.0) as usize - 1;
                (s, text(args, 1)?, text(args, 2)?)
            } else {
                (0, text(args, 0)?, text(args, 1)?)
            };
            let from = start.min(haystack.len());
            let found = haystack[from..].find(&needle).map(|p| p + from + 1).unwrap_or(0);
            Ok(Value::Number(found as f64))
        }
        "STRING" => {
            let count = num(args, 0)?.round().max(0.0) as usize;
            let c = match args.get(1) {
                Some(Value::Text(s)) => s.chars().next().unwrap_or(' '),
                Some(v) => cp437_to_unicode(v.as_number()?.round() as u8),
                None => return Err(ErrorCode::IllegalFunctionCall),
            };
            Ok(Value::Text(c.to_string().repeat(count)))
        }
        "SPACE" => {
            let n = num(args, 0)?.round().max(0.0) as usize;
            Ok(Value::Text(" ".repeat(n)))
        }
        // TAB and SPC only position within PRINT lists
        "TAB" | "SPC" => Err(ErrorCode::IllegalFunctionCall),
        "UCASE" => Ok(Value::Text(text(args, 0)?.to_uppercase())),
        "LCASE" => Ok(Value::Text(text(args, 0)?.to_lowercase())),
        "LTRIM" => Ok(Value::Text(text(args, 0)?.trim_start().to_string())),
        "RTRIM" => Ok(Value::Text(text(args, 0)?.trim_end().to_string())),
        "HEX" => Ok(Value::Text(format!("{:X}", num(args, 0)?.round() as i64))),
        "OCT" => Ok(Value::Text(format!("{:o}", num(args, 0)?.round() as i64))),

        // Conversions
        "CINT" => {
            let n = num(args, 0)?.round();
            if !(-32768.0..=32767.0).contains(&n) {
                Err(ErrorCode::Overflow)
            } else {
                Ok(Value::Number(n))
            }
        }
        "CLNG" => Ok(Value::Number(num(args, 0)?.round())),
        "CSNG" | "CDBL" => Ok(Value::Number(num(args, 0)?)),
        "CVI" => {
            let b = bytes_of(&text(args, 0)?);
            if b.len() < 2 {
                return Err(ErrorCode::IllegalFunctionCall);
            }
            Ok(Value::Number(i16::from_le_bytes([b[0], b[1]]) as f64))
        }
        "CVS" => {
            let b = bytes_of(&text(args, 0)?);
            if b.len() < 4 {
                return Err(ErrorCode::IllegalFunctionCall);
            }
            Ok(Value::Number(
                f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            ))
        }
        "CVD" => {
            let b = bytes_of(&text(args, 0)?);
            if b.len() < 8 {
                return Err(ErrorCode::IllegalFunctionCall);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&b[..8]);
            Ok(Value::Number(f64::from_le_bytes(raw)))
        }
        "MKI" => {
            let n = num(args, 0)?.trunc();
            if !(-32768.0..=32767.0).contains(&n) {
                return Err(ErrorCode::Overflow);
            }
            Ok(Value::Text(string_of(&(n as i16).to_le_bytes())))
        }
        "MKS" => Ok(Value::Text(string_of(&(num(args, 0)? as f32).to_le_bytes()))),
        "MKD" => Ok(Value::Text(string_of(&num(args, 0)?.to_le_bytes()))),

        // Screen and time
        "TIMER" => Ok(Value::Number(seconds_since_midnight())),
        "INKEY" => Ok(Value::Text(state.read_key())),
        "CSRLIN" => Ok(Value::Number(state.graphics.cursor().0 as f64)),
        "POS" => Ok(Value::Number(state.graphics.cursor().1 as f64)),
        "POINT" => {
            let x = num(args, 0)?.round() as i32;
            let y = num(args, 1)?.round() as i32;
            Ok(Value::Number(state.graphics.active_ref().get_pixel(x, y) as f64))
        }
        "DATE" => Ok(Value::Text(current_date())),
        "TIME" => Ok(Value::Text(current_time())),

        // Files
        "EOF" => {
            let n = num(args, 0)?.round() as u32;
            Ok(Value::Number(if state.files.get_ref(n)?.eof() { -1.0 } else { 0.0 }))
        }
        "LOF" => {
            let n = num(args, 0)?.round() as u32;
            Ok(Value::Number(state.files.get_ref(n)?.lof() as f64))
        }
        "LOC" => {
            let n = num(args, 0)?.round() as u32;
            Ok(Value::Number(state.files.get_ref(n)?.loc() as f64))
        }
        "INPUT" => {
            let n = num(args, 0)?.round().max(0.0) as usize;
            if args.len() > 1 {
                let file = num(args, 1)?.round() as u32;
                let s = state.files.get(file)?.input_chars(n)?;
                Ok(Value::Text(s))
            } else {
                let mut s = String::new();
                while s.chars().count() < n {
                    if state.stopped() {
                        return Err(ErrorCode::Break);
                    }
                    let key = state.read_key();
                    if key.is_empty() {
                        std::thread::sleep(std::time::Duration::from_millis(5));
                    } else {
                        s.push_str(&key);
                    }
                }
                Ok(Value::Text(s))
            }
        }

        // Memory
        "PEEK" => {
            let _ = num(args, 0)?;
            Ok(Value::Number(0.0))
        }
        "FRE" => Ok(Value::Number(65536.0)),

        // Error state
        "ERR" => Ok(Value::Number(state.last_error_code as f64)),
        "ERL" => Ok(Value::Number(state.last_error_line as f64)),

        // Color
        "RGB" => {
            let r = num(args, 0)?.round().clamp(0.0, 255.0) as u8;
            let g = num(args, 1)?.round().clamp(0.0, 255.0) as u8;
            let b = num(args, 2)?.round().clamp(0.0, 255.0) as u8;
            Ok(Value::Number(pack_rgb(r, g, b) as f64))
        }

        _ => Err(ErrorCode::IllegalFunctionCall),
    }
}

/// VAL semantics: the longest numeric prefix, or 0.
fn leading_number(s: &str) -> f64 {
    let t = s.trim_start();
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    for (i, c) in t.char_indices() {
        match c {
            '+' | '-' if i == 0 => {}
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot && !seen_exp => seen_dot = true,
            'E' | 'e' | 'D' | 'd' if seen_digit && !seen_exp => seen_exp = true,
            '+' | '-' if seen_exp && matches!(t[..i].chars().last(), Some('E' | 'e' | 'D' | 'd')) => {}
            _ => break,
        }
        end = i + c.len_utf8();
    }
    if !seen_digit {
        return 0.0;
    }
    t[..end].replace(['D', 'd'], "E").parse().unwrap_or(0.0)
}

fn seconds_since_midnight() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    secs % 86400.0
}

fn current_date() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let days = secs / 86400;
    // Civil-date conversion over the proleptic Gregorian calendar
    let z = days as i64 + 719468;
    let era = z.div_euclid(146097);
    let doe = z.rem_euclid(146097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    format!("{:02}-{:02}-{:04}", m, d, y)
}

fn current_time() -> String {
    let day_secs = seconds_since_midnight() as u64;
    format!(
        "{:02}:{:02}:{:02}",
        day_secs / 3600,
        (day_secs % 3600) / 60,
        day_secs % 60
    )
}

/// Convert CP437 (DOS) character code to Unicode
fn cp437_to_unicode(code: u8) -> char {
    match code {
        0 => ' ',
        1 => '☺', 2 => '☻', 3 => '♥', 4 => '♦', 5 => '♣', 6 => '♠', 7 => '•',
        8 => '◘', 9 => '○', 10 => '◙', 11 => '♂', 12 => '♀', 13 => '♪', 14 => '♫', 15 => '☼',
        16 => '►', 17 => '◄', 18 => '↕', 19 => '‼', 20 => '¶', 21 => '§', 22 => '▬', 23 => '↨',
        24 => '↑', 25 => '↓', 26 => '→', 27 => '←', 28 => '∟', 29 => '↔', 30 => '▲', 31 => '▼',
        32..=126 => code as char,
        127 => '⌂',
        128 => 'Ç', 129 => 'ü', 130 => 'é', 131 => 'â', 132 => 'ä', 133 => 'à', 134 => 'å', 135 => 'ç',
        136 => 'ê', 137 => 'ë', 138 => 'è', 139 => 'ï', 140 => 'î', 141 => 'ì', 142 => 'Ä', 143 => 'Å',
        144 => 'É', 145 => 'æ', 146 => 'Æ', 147 => 'ô', 148 => 'ö', 149 => 'ò', 150 => 'û', 151 => 'ù',
        152 => 'ÿ', 153 => 'Ö', 154 => 'Ü', 155 => '¢', 156 => '£', 157 => '¥', 158 => '₧', 159 => 'ƒ',
        160 => 'á', 161 => 'í', 162 => 'ó', 163 => 'ú', 164 => 'ñ', 165 => 'Ñ', 166 => 'ª', 167 => 'º',
        168 => '¿', 169 => '⌐', 170 => '¬', 171 => '½', 172 => '¼', 173 => '¡', 174 => '«', 175 => '»',
        176 => '░', 177 => '▒', 178 => '▓',
        179 => '│', 180 => '┤', 181 => '╡', 182 => '╢', 183 => '╖', 184 => '╕', 185 => '╣',
        186 => '║', 187 => '╗', 188 => '╝', 189 => '╜', 190 => '╛', 191 => '┐',
        192 => '└', 193 => '┴', 194 => '┬', 195 => '├', 196 => '─',
        197 => '┼', 198 => '╞', 199 => '╟', 200 => '╚', 201 => '╔', 202 => '╩', 203 => '╦',
        204 => '╠', 205 => '═', 206 => '╬', 207 => '╧', 208 => '╨', 209 => '╤', 210 => '╥',
        211 => '╙', 212 => '╘', 213 => '╒', 214 => '╓', 215 => '╫', 216 => '╪', 217 => '┘', 218 => '┌',
        219 => '█', 220 => '▄', 221 => '▌', 222 => '▐', 223 => '▀',
        224 => 'α', 225 => 'ß', 226 => 'Γ', 227 => 'π', 228 => 'Σ', 229 => 'σ', 230 => 'µ', 231 => 'τ',
        232 => 'Φ', 233 => 'Θ', 234 => 'Ω', 235 => 'δ', 236 => '∞', 237 => 'φ', 238 => 'ε', 239 => '∩',
        240 => '≡', 241 => '±', 242 => '≥', 243 => '≤', 244 => '⌠', 245 => '⌡', 246 => '÷', 247 => '≈',
        248 => '°', 249 => '∙', 250 => '·', 251 => '√', 252 => 'ⁿ', 253 => '²', 254 => '■', 255 => ' ',
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn val_takes_the_leading_number() {
        assert_eq!(leading_number("12AB"), 12.0);
        assert_eq!(leading_number("  -3.5 "), -3.5);
        assert_eq!(leading_number("1E2X"), 100.0);
        assert_eq!(leading_number("ABC"), 0.0);
        assert_eq!(leading_number(""), 0.0);
    }

    #[test]
    fn mki_cvi_round_trip() {
        for n in [-32768i16, -1, 0, 1, 12345, 32767] {
            let packed = string_of(&n.to_le_bytes());
            let back = i16::from_le_bytes([
                bytes_of(&packed)[0],
                bytes_of(&packed)[1],
            ]);
            assert_eq!(back, n);
        }
    }

    #[test]
    fn cp437_box_drawing() {
        assert_eq!(cp437_to_unicode(219), '█');
        assert_eq!(cp437_to_unicode(196), '─');
        assert_eq!(cp437_to_unicode(65), 'A');
    }
}
