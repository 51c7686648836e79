/*!
Output file naming.

File templates use printf-style conversions, as areaDetector's NDFile
plugins do: `%s_%04d.h5` applied to `("test", 3)` gives `test_0003.h5`.
The first argument is the base file name, the second the file number.
*/

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

use crate::error::{Result, SharedError};

static CONVERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"%([-+ 0#]*)(\d*)(?:\.(\d+))?([a-zA-Z%])").expect("conversion pattern is valid")
});

/// Largest field width or precision a conversion may request
pub const MAX_FIELD_SIZE: usize = 255;

#[derive(Debug, Clone, Copy)]
enum Arg<'a> {
    Str(&'a str),
    Int(i64),
}

/// Apply a template to a base name and file number
pub fn format_template(template: &str, name: &str, number: i64) -> Result<String> {
    let args = [Arg::Str(name), Arg::Int(number)];
    let mut args = args.iter();
    let mut out = String::with_capacity(template.len() + name.len() + 8);
    let mut last = 0;

    for caps in CONVERSION.captures_iter(template) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        push_literal(&mut out, template, &template[last..whole.start])?;
        last = whole.end;

        let flags = caps.get(1).map_or("", |m| m.as_str());
        let width = match caps.get(2).map(|m| m.as_str()).filter(|w| !w.is_empty()) {
            Some(w) => field_size(template, "width", w)?,
            None => 0,
        };
        let precision = match caps.get(3) {
            Some(p) => Some(field_size(template, "precision", p.as_str())?),
            None => None,
        };
        let conversion = caps.get(4).map_or("", |m| m.as_str());

        if conversion == "%" {
            out.push('%');
            continue;
        }

        let arg = args
            .next()
            .ok_or_else(|| SharedError::template(template, "not enough arguments"))?;

        let body = match (conversion, arg) {
            ("s", Arg::Str(s)) => truncate_chars(s, precision),
            ("s", Arg::Int(n)) => truncate_chars(&n.to_string(), precision),
            ("d" | "i" | "u", Arg::Int(n)) => {
                format_integer(*n, flags, width, precision)
            }
            ("d" | "i" | "u", Arg::Str(_)) => {
                return Err(SharedError::template(
                    template,
                    format!("%{} requires a number", conversion),
                ))
            }
            (other, _) => {
                return Err(SharedError::template(
                    template,
                    format!("unsupported conversion %{}", other),
                ))
            }
        };
        pad(&mut out, &body, flags, width);
    }
    push_literal(&mut out, template, &template[last..])?;

    if args.next().is_some() {
        return Err(SharedError::template(
            template,
            "not all arguments converted",
        ));
    }
    Ok(out)
}

/// Join the output directory with the templated file name
pub fn full_file_name(path: &str, template: &str, name: &str, number: i64) -> Result<PathBuf> {
    Ok(Path::new(path).join(format_template(template, name, number)?))
}

/// Field width or precision, bounded so a template cannot ask for a huge name
fn field_size(template: &str, what: &str, digits: &str) -> Result<usize> {
    digits
        .parse::<usize>()
        .ok()
        .filter(|n| *n <= MAX_FIELD_SIZE)
        .ok_or_else(|| {
            SharedError::template(template, format!("{} {} exceeds {}", what, digits, MAX_FIELD_SIZE))
        })
}

fn push_literal(out: &mut String, template: &str, literal: &str) -> Result<()> {
    if literal.contains('%') {
        return Err(SharedError::template(template, "incomplete format"));
    }
    out.push_str(literal);
    Ok(())
}

fn truncate_chars(s: &str, precision: Option<usize>) -> String {
    match precision {
        Some(p) => s.chars().take(p).collect(),
        None => s.to_string(),
    }
}

fn format_integer(n: i64, flags: &str, width: usize, precision: Option<usize>) -> String {
    let sign = if n < 0 {
        "-"
    } else if flags.contains('+') {
        "+"
    } else if flags.contains(' ') {
        " "
    } else {
        ""
    };
    let mut digits = n.unsigned_abs().to_string();
    if let Some(p) = precision {
        if digits.len() < p {
            digits = format!("{}{}", "0".repeat(p - digits.len()), digits);
        }
    }
    if flags.contains('0') && !flags.contains('-') && precision.is_none() {
        let used = sign.len() + digits.len();
        if used < width {
            digits = format!("{}{}", "0".repeat(width - used), digits);
        }
    }
    format!("{}{}", sign, digits)
}

fn pad(out: &mut String, body: &str, flags: &str, width: usize) {
    let len = body.chars().count();
    if len >= width {
        out.push_str(body);
    } else if flags.contains('-') {
        out.push_str(body);
        out.push_str(&" ".repeat(width - len));
    } else {
        out.push_str(&" ".repeat(width - len));
        out.push_str(body);
    }
}
