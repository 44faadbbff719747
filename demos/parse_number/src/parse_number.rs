//! A tiny fuzz target in the shape the instrumenter produces: every branch
//! site of `parse_number` calls the counter probe with its own identifier.
//!
//! Run it with `afl-fuzz -i corpus -o findings -- ./parse_number`. Without
//! afl-fuzz it parses stdin once.

use anyhow::Result;
use ilfuzz::trace::on_branch_call;

const METHOD: &str = "System.Int64 Demo.Number::Parse(System.String)";

fn parse_number(text: &str) -> Option<i64> {
    on_branch_call(0x17, METHOD);
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => {
            on_branch_call(0x4c, METHOD);
            (true, rest)
        }
        None => {
            on_branch_call(0x91, METHOD);
            (false, text)
        }
    };

    if digits.is_empty() {
        on_branch_call(0x2e, METHOD);
        return None;
    }

    let mut value: i64 = 0;
    for c in digits.chars() {
        on_branch_call(0xb3, METHOD);
        let digit = c.to_digit(10)?;
        // Overflows on long inputs: the bug for the fuzzer to find.
        value = value * 10 + i64::from(digit);
    }

    if negative {
        on_branch_call(0xd8, METHOD);
        value = -value;
    }
    Some(value)
}

fn main() -> Result<()> {
    if let Ok(path) = std::env::var("PARSE_NUMBER_LOG") {
        ilfuzz::logging::init_with_file(std::path::Path::new(&path))?;
    }

    ilfuzz::forkserver::run_str(|text| {
        if let Some(value) = parse_number(text) {
            log::debug!("Parsed {value}");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_numbers() {
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number(" -7 "), Some(-7));
        assert_eq!(parse_number("-"), None);
        assert_eq!(parse_number("4x"), None);
    }
}
