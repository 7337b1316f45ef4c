//! Parser for pubsub commands
//!
//! Turns one command string into an `ast::Command`. Keywords are lowercase
//! only; identifiers start with a letter followed by letters or digits.
//! Literals need single quotes only when they contain a comma, whitespace,
//! `)` or `'`.

use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{alt, cut_err, opt, preceded, separated};
use winnow::error::{ErrMode, StrContext, StrContextValue};
use winnow::prelude::*;
use winnow::token::{one_of, take_while};

use crate::ast::{Assignment, Clause, Command, Filter, ID_COLUMN, Projection};

type PResult<T> = winnow::ModalResult<T>;

const KEYWORDS: &[&str] = &[
    "key",
    "tag",
    "insert",
    "update",
    "delete",
    "select",
    "subscribe",
    "unsubscribe",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (line {}, column {}, offset {})",
            self.message, self.line, self.column, self.offset
        )
    }
}

impl std::error::Error for ParseError {}

/// Parse a single command
pub fn parse(input: &str) -> Result<Command, ParseError> {
    let input = input.trim();
    let mut stream = input;

    let keyword = match word.parse_next(&mut stream) {
        Ok(keyword) => keyword,
        Err(_) => {
            return Err(build_parse_error(
                "expected a command keyword".to_string(),
                input,
                0,
            ));
        }
    };

    let result = match keyword {
        "key" => index_def
            .map(|(table, column)| Command::Key { table, column })
            .parse_next(&mut stream),
        "tag" => index_def
            .map(|(table, column)| Command::Tag { table, column })
            .parse_next(&mut stream),
        "insert" => insert.parse_next(&mut stream),
        "update" => update.parse_next(&mut stream),
        "delete" => delete.parse_next(&mut stream),
        "select" => projected
            .map(|(projection, table, filter)| Command::Select {
                table,
                projection,
                filter,
            })
            .parse_next(&mut stream),
        "subscribe" => projected
            .map(|(projection, table, filter)| Command::Subscribe {
                table,
                projection,
                filter,
            })
            .parse_next(&mut stream),
        "unsubscribe" => unsubscribe.parse_next(&mut stream),
        other => return Err(build_parse_error(unknown_command(other), input, 0)),
    };

    let command = match result {
        Ok(command) => command,
        Err(e) => {
            let offset = input.len().saturating_sub(stream.len());
            return Err(build_parse_error(error_message(e), input, offset));
        }
    };

    if !stream.trim().is_empty() {
        let offset = trailing_input_offset(input, stream);
        return Err(build_parse_error(
            trailing_message(&input[offset..]),
            input,
            offset,
        ));
    }

    validate(&command).map_err(|message| build_parse_error(message, input, 0))?;
    Ok(command)
}

fn unknown_command(keyword: &str) -> String {
    let lowered = keyword.to_ascii_lowercase();
    if KEYWORDS.contains(&lowered.as_str()) {
        format!("unknown command '{keyword}' (commands must be lowercase)")
    } else {
        format!("unknown command '{keyword}'")
    }
}

fn error_message(e: ErrMode<winnow::error::ContextError>) -> String {
    let rendered = match e {
        ErrMode::Backtrack(e) | ErrMode::Cut(e) => e.to_string(),
        ErrMode::Incomplete(_) => String::new(),
    };
    let rendered = rendered.lines().collect::<Vec<_>>().join("; ");
    if rendered.is_empty() {
        "syntax error".to_string()
    } else {
        rendered
    }
}

fn trailing_message(rest: &str) -> String {
    let token: String = rest
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != ',')
        .collect();
    if token == "or" {
        "'or' is not supported in where clauses, only 'and'".to_string()
    } else {
        format!(
            "unexpected trailing input '{token}' \
             (quote literals containing commas, whitespace, ')' or ''')"
        )
    }
}

/// Semantic checks that do not fit the grammar
fn validate(command: &Command) -> Result<(), String> {
    match command {
        Command::Key { column, .. } | Command::Tag { column, .. } if column == ID_COLUMN => {
            Err(format!("column '{ID_COLUMN}' is reserved and cannot be indexed"))
        }
        Command::Insert {
            columns, values, ..
        } => {
            if columns.len() != values.len() {
                return Err(format!(
                    "insert lists {} columns but {} values \
                     (quote literals containing commas, whitespace, ')' or ''')",
                    columns.len(),
                    values.len()
                ));
            }
            check_columns(columns.iter().map(String::as_str))
        }
        Command::Update { assignments, .. } => {
            check_columns(assignments.iter().map(|a| a.column.as_str()))
        }
        _ => Ok(()),
    }
}

fn check_columns<'a>(columns: impl Iterator<Item = &'a str>) -> Result<(), String> {
    let mut seen = std::collections::HashSet::new();
    for column in columns {
        if column == ID_COLUMN {
            return Err(format!("column '{ID_COLUMN}' is reserved and cannot be set"));
        }
        if !seen.insert(column) {
            return Err(format!("column '{column}' is given more than once"));
        }
    }
    Ok(())
}

fn build_parse_error(message: String, input: &str, offset: usize) -> ParseError {
    let (line, column) = offset_to_line_column(input, offset);
    ParseError {
        message,
        offset,
        line,
        column,
    }
}

fn offset_to_line_column(input: &str, offset: usize) -> (usize, usize) {
    let bounded = offset.min(input.len());
    let mut line = 1usize;
    let mut column = 1usize;

    for ch in input[..bounded].chars() {
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }

    (line, column)
}

fn trailing_input_offset(input: &str, trailing: &str) -> usize {
    let base = input.len().saturating_sub(trailing.len());
    let non_ws = trailing
        .char_indices()
        .find(|(_, ch)| !ch.is_whitespace())
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    base + non_ws
}

// ============ Commands ============

fn index_def(input: &mut &str) -> PResult<(String, String)> {
    (table_name, column_name).parse_next(input)
}

fn insert(input: &mut &str) -> PResult<Command> {
    (
        kw("into"),
        table_name,
        preceded((ws, '('), separated(1.., column_name, (ws, ','))),
        (ws, ')'),
        kw("values"),
        preceded((ws, '('), separated(1.., literal, (ws, ','))),
        (ws, ')'),
    )
        .map(|(_, table, columns, _, _, values, _)| Command::Insert {
            table,
            columns,
            values,
        })
        .parse_next(input)
}

fn update(input: &mut &str) -> PResult<Command> {
    (
        table_name,
        kw("set"),
        separated(1.., assignment, (ws, ',')),
        filter,
    )
        .map(|(table, _, assignments, filter)| Command::Update {
            table,
            assignments,
            filter,
        })
        .parse_next(input)
}

fn delete(input: &mut &str) -> PResult<Command> {
    (kw("from"), table_name, filter)
        .map(|(_, table, filter)| Command::Delete { table, filter })
        .parse_next(input)
}

/// Shared tail of `select` and `subscribe`: `[cols] from <table> [where ...]`
fn projected(input: &mut &str) -> PResult<(Projection, String, Filter)> {
    (projection, kw("from"), table_name, filter)
        .map(|(projection, _, table, filter)| (projection, table, filter))
        .parse_next(input)
}

fn unsubscribe(input: &mut &str) -> PResult<Command> {
    (
        kw("from"),
        table_name,
        opt(preceded(
            kw("where"),
            cut_err((kw("pubsubid"), ws, '=', ws, subscription_id)),
        )),
    )
        .map(|(_, table, id)| Command::Unsubscribe {
            table,
            pubsubid: id.map(|(_, _, _, _, id)| id),
        })
        .parse_next(input)
}

fn subscription_id(input: &mut &str) -> PResult<u64> {
    digit1
        .try_map(|s: &str| s.parse::<u64>())
        .context(StrContext::Label("pubsubid"))
        .parse_next(input)
}

// ============ Clauses ============

fn projection(input: &mut &str) -> PResult<Projection> {
    opt(alt((
        preceded(ws, '*').value(Projection::All),
        separated(1.., projected_column, (ws, ',')).map(Projection::Columns),
    )))
    .map(|projection| projection.unwrap_or(Projection::All))
    .parse_next(input)
}

fn projected_column(input: &mut &str) -> PResult<String> {
    ident.verify(|name: &str| name != "from").parse_next(input)
}

fn filter(input: &mut &str) -> PResult<Filter> {
    opt(preceded(
        kw("where"),
        cut_err(separated(1.., clause, kw("and"))),
    ))
    .map(|clauses: Option<Vec<Clause>>| Filter {
        clauses: clauses.unwrap_or_default(),
    })
    .parse_next(input)
}

fn clause(input: &mut &str) -> PResult<Clause> {
    (column_name, ws, '=', literal)
        .map(|(column, _, _, value)| Clause { column, value })
        .parse_next(input)
}

fn assignment(input: &mut &str) -> PResult<Assignment> {
    (column_name, ws, '=', literal)
        .map(|(column, _, _, value)| Assignment { column, value })
        .parse_next(input)
}

// ============ Identifiers ============

fn table_name(input: &mut &str) -> PResult<String> {
    ident
        .context(StrContext::Label("table name"))
        .parse_next(input)
}

fn column_name(input: &mut &str) -> PResult<String> {
    ident
        .context(StrContext::Label("column name"))
        .parse_next(input)
}

fn ident(input: &mut &str) -> PResult<String> {
    preceded(
        ws,
        (
            one_of(|c: char| c.is_ascii_alphabetic()),
            take_while(0.., |c: char| c.is_ascii_alphanumeric()),
        )
            .take(),
    )
    .map(|s: &str| s.to_string())
    .parse_next(input)
}

fn word<'a>(input: &mut &'a str) -> PResult<&'a str> {
    take_while(1.., |c: char| c.is_ascii_alphanumeric()).parse_next(input)
}

/// A whole lowercase keyword, not a prefix of a longer word
fn kw<'a>(keyword: &'static str) -> impl FnMut(&mut &'a str) -> PResult<()> {
    move |input: &mut &'a str| {
        preceded(ws, word)
            .verify(|w: &str| w == keyword)
            .void()
            .context(StrContext::Expected(StrContextValue::StringLiteral(keyword)))
            .parse_next(input)
    }
}

// ============ Literals ============

fn is_delimiter(c: char) -> bool {
    c == ',' || c == ')' || c == '\'' || c.is_whitespace()
}

fn literal(input: &mut &str) -> PResult<String> {
    preceded(ws, alt((quoted_literal, bare_literal)))
        .context(StrContext::Label("literal"))
        .parse_next(input)
}

fn bare_literal(input: &mut &str) -> PResult<String> {
    take_while(1.., |c: char| !is_delimiter(c))
        .map(|s: &str| s.to_string())
        .parse_next(input)
}

/// `'...'` with `''` standing for an embedded quote
fn quoted_literal(input: &mut &str) -> PResult<String> {
    preceded('\'', quoted_contents).parse_next(input)
}

fn quoted_contents(input: &mut &str) -> PResult<String> {
    let mut value = String::new();
    loop {
        value.push_str(quoted_chunk(input)?);
        closing_quote(input)?;
        if let Some(rest) = input.strip_prefix('\'') {
            value.push('\'');
            *input = rest;
        } else {
            return Ok(value);
        }
    }
}

fn quoted_chunk<'a>(input: &mut &'a str) -> PResult<&'a str> {
    take_while(0.., |c: char| c != '\'').parse_next(input)
}

fn closing_quote(input: &mut &str) -> PResult<()> {
    cut_err('\'')
        .void()
        .context(StrContext::Expected(StrContextValue::Description(
            "closing quote",
        )))
        .parse_next(input)
}

// ============ Whitespace ============

fn ws(input: &mut &str) -> PResult<()> {
    multispace0.void().parse_next(input)
}

// ============ Sanity Tests ============
// Most testing is done via integration tests in tests/integration.rs
