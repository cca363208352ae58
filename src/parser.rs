use std::io::BufRead;
use std::path::PathBuf;

use tracing::debug;

use crate::console;
use crate::error::SpecError;
use crate::job::{JobSpec, RestartBudget};

const COMMENT: char = '#';
const FIELD_SEPARATOR: char = ':';

/// Split a command line on whitespace. A double-quoted span is kept as a
/// single token with the quotes dropped, so `echo "a b"` yields `["echo", "a b"]`.
pub fn split_command(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;

    for c in input.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Digits only, nothing else: no sign, no padding, no trailing junk.
pub fn parse_non_negative(token: &str) -> Option<u64> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

/// Parse one job file line of the form `restarts:input:output:command`.
///
/// Returns `Ok(None)` for comments and blank lines.
pub fn parse_job_line(line: &str) -> Result<Option<JobSpec>, SpecError> {
    if line.is_empty() || line.starts_with(COMMENT) {
        return Ok(None);
    }

    let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
    if fields.len() != 4 {
        return Err(SpecError::FieldCount { found: fields.len() });
    }
    let (restarts, input, output, command) = (fields[0], fields[1], fields[2], fields[3]);

    let budget = if restarts.is_empty() {
        RestartBudget::Unlimited
    } else {
        let n = parse_non_negative(restarts)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| SpecError::RestartCount(restarts.to_string()))?;
        RestartBudget::from_count(n)
    };

    if command.is_empty() || command.starts_with(' ') {
        return Err(SpecError::Command);
    }

    Ok(Some(JobSpec {
        budget,
        input: path_field(input),
        output: path_field(output),
        command: command.to_string(),
    }))
}

fn path_field(field: &str) -> Option<PathBuf> {
    (!field.is_empty()).then(|| PathBuf::from(field))
}

/// Read every job specification from `reader`, skipping invalid lines.
/// Rejections are reported on stderr only when `verbose` is set.
pub fn load_jobs<R: BufRead>(reader: R, verbose: bool) -> std::io::Result<Vec<JobSpec>> {
    let mut specs = Vec::new();
    for line in reader.lines() {
        let line = line?;
        match parse_job_line(&line) {
            Ok(Some(spec)) => specs.push(spec),
            Ok(None) => {}
            Err(err) => {
                debug!(kind = err.as_label(), %err, line = %line, "rejected job line");
                if verbose {
                    console::err(format_args!("Error: invalid job specification: {}", line));
                }
            }
        }
    }
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn split_honours_quotes() {
        assert_eq!(split_command("cat"), vec!["cat"]);
        assert_eq!(
            split_command("  echo  \"hello world\" again "),
            vec!["echo", "hello world", "again"]
        );
        assert_eq!(split_command("*signal 3 9"), vec!["*signal", "3", "9"]);
        assert_eq!(split_command("printf \"\""), vec!["printf", ""]);
        assert!(split_command("   ").is_empty());
    }

    #[test]
    fn non_negative_rejects_junk() {
        assert_eq!(parse_non_negative("500"), Some(500));
        assert_eq!(parse_non_negative("0"), Some(0));
        assert_eq!(parse_non_negative("abc"), None);
        assert_eq!(parse_non_negative("12x"), None);
        assert_eq!(parse_non_negative("-1"), None);
        assert_eq!(parse_non_negative(" 1"), None);
        assert_eq!(parse_non_negative(""), None);
    }

    #[test]
    fn parses_pipe_job() {
        let spec = parse_job_line(":::cat").unwrap().unwrap();
        assert_eq!(spec.budget, RestartBudget::Unlimited);
        assert_eq!(spec.input, None);
        assert_eq!(spec.output, None);
        assert_eq!(spec.command, "cat");
    }

    #[test]
    fn parses_files_and_budget() {
        let spec = parse_job_line("2:in.txt:out.txt:sort -r").unwrap().unwrap();
        assert_eq!(spec.budget, RestartBudget::Limited(2));
        assert_eq!(spec.input, Some(PathBuf::from("in.txt")));
        assert_eq!(spec.output, Some(PathBuf::from("out.txt")));
        assert_eq!(spec.command, "sort -r");
    }

    #[test]
    fn zero_budget_is_unlimited() {
        let spec = parse_job_line("0:::cat").unwrap().unwrap();
        assert_eq!(spec.budget, RestartBudget::Unlimited);
    }

    #[test]
    fn skips_comments_and_blanks() {
        assert_eq!(parse_job_line("").unwrap(), None);
        assert_eq!(parse_job_line("# 1:::cat").unwrap(), None);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(parse_job_line("::cat"), Err(SpecError::FieldCount { found: 3 }));
        assert_eq!(parse_job_line("::::cat"), Err(SpecError::FieldCount { found: 5 }));
        assert_eq!(
            parse_job_line("x:::cat"),
            Err(SpecError::RestartCount("x".into()))
        );
        assert_eq!(parse_job_line(":::"), Err(SpecError::Command));
        assert_eq!(parse_job_line("::: cat"), Err(SpecError::Command));
    }

    #[test]
    fn load_keeps_valid_lines_in_order() {
        let file = "# workers\n:::cat\nbad line\n\n3:::sleep 1\n";
        let specs = load_jobs(file.as_bytes(), false).unwrap();
        let commands: Vec<&str> = specs.iter().map(|s| s.command.as_str()).collect();
        assert_eq!(commands, vec!["cat", "sleep 1"]);
        assert_eq!(specs[1].budget, RestartBudget::Limited(3));
    }
}
