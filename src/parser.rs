use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_until, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{map_res, opt},
    sequence::{delimited, preceded},
    IResult,
};

use crate::artifact::ReviewKind;
use crate::model::CollectionKind;

#[derive(Debug, PartialEq, Clone)]
pub enum Command {
    Find {
        collection: CollectionKind,
        text: String,
        user_id: String,
        project_id: Option<String>,
        limit: Option<usize>,
    },
    Context {
        user_id: String,
        project_id: String,
        review_type: ReviewKind,
        code: String,
    },
    Store {
        collection: CollectionKind,
        document: String,
        user_id: String,
        project_id: Option<String>,
        id: Option<String>,
    },
    Get { collection: CollectionKind, id: String },
    Stats { user_id: Option<String> },
    Purge { user_id: String },
    Compact,
    Clear { collection: CollectionKind },
    Help,
    Exit,
}

// --- BASIC PARSERS ---

/// `"..."`; `\n` and `\"`-free, as typed at the prompt.
fn parse_double_quoted(input: &str) -> IResult<&str, String> {
    let (input, _) = char('"')(input)?;
    let (input, content) = take_until("\"")(input)?;
    let (input, _) = char('"')(input)?;
    Ok((input, content.replace("\\n", "\n")))
}

fn parse_single_quoted(input: &str) -> IResult<&str, String> {
    let (input, _) = char('\'')(input)?;
    let (input, content) = take_until("'")(input)?;
    let (input, _) = char('\'')(input)?;
    Ok((input, content.to_string()))
}

fn parse_collection(input: &str) -> IResult<&str, CollectionKind> {
    map_res(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        |s: &str| s.parse::<CollectionKind>(),
    )(input)
}

fn parse_review_kind(input: &str) -> IResult<&str, ReviewKind> {
    map_res(take_while1(|c: char| c.is_ascii_alphabetic()), |s: &str| {
        s.parse::<ReviewKind>()
    })(input)
}

// --- HELPERS ---
fn ws<'a, F, O, E: nom::error::ParseError<&'a str>>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where F: FnMut(&'a str) -> IResult<&'a str, O, E> {
    delimited(multispace0, inner, multispace0)
}

fn tag_ci(t: &'static str) -> impl FnMut(&str) -> IResult<&str, &str> {
    move |input| tag_no_case(t)(input)
}

/// `KEYWORD 'value'`
fn keyword_value(kw: &'static str) -> impl FnMut(&str) -> IResult<&str, String> {
    move |input| preceded(ws(tag_ci(kw)), parse_single_quoted)(input)
}

// --- COMMAND PARSERS ---

// FIND IN <collection> "text" USER 'u' [PROJECT 'p'] [LIMIT n]
fn parse_find(input: &str) -> IResult<&str, Command> {
    let (input, _) = alt((tag_ci("FIND"), tag_ci("SEARCH")))(input)?;
    let (input, _) = ws(tag_ci("IN"))(input)?;
    let (input, collection) = parse_collection(input)?;
    let (input, text) = preceded(multispace1, parse_double_quoted)(input)?;
    let (input, user_id) = keyword_value("USER")(input)?;
    let (input, project_id) = opt(keyword_value("PROJECT"))(input)?;
    let (input, limit) = opt(preceded(
        ws(tag_ci("LIMIT")),
        map_res(digit1, |s: &str| s.parse::<usize>()),
    ))(input)?;
    Ok((input, Command::Find { collection, text, user_id, project_id, limit }))
}

// CONTEXT USER 'u' PROJECT 'p' FOR security|logic|testing "code"
fn parse_context(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("CONTEXT")(input)?;
    let (input, user_id) = keyword_value("USER")(input)?;
    let (input, project_id) = keyword_value("PROJECT")(input)?;
    let (input, _) = ws(tag_ci("FOR"))(input)?;
    let (input, review_type) = parse_review_kind(input)?;
    let (input, code) = preceded(multispace1, parse_double_quoted)(input)?;
    Ok((input, Command::Context { user_id, project_id, review_type, code }))
}

// STORE INTO <collection> "doc" USER 'u' [PROJECT 'p'] [ID 'id']
fn parse_store(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("STORE")(input)?;
    let (input, _) = ws(tag_ci("INTO"))(input)?;
    let (input, collection) = parse_collection(input)?;
    let (input, document) = preceded(multispace1, parse_double_quoted)(input)?;
    let (input, user_id) = keyword_value("USER")(input)?;
    let (input, project_id) = opt(keyword_value("PROJECT"))(input)?;
    let (input, id) = opt(keyword_value("ID"))(input)?;
    Ok((input, Command::Store { collection, document, user_id, project_id, id }))
}

fn parse_get(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("GET")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, collection) = parse_collection(input)?;
    let (input, _) = multispace1(input)?;
    let (input, id) = parse_single_quoted(input)?;
    Ok((input, Command::Get { collection, id }))
}

fn parse_stats(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("STATS")(input)?;
    let (input, user_id) = opt(keyword_value("USER"))(input)?;
    Ok((input, Command::Stats { user_id }))
}

fn parse_purge(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("PURGE")(input)?;
    let (input, _) = opt(ws(tag_ci("USER")))(input)?;
    let (input, user_id) = ws(parse_single_quoted)(input)?;
    Ok((input, Command::Purge { user_id }))
}

fn parse_compact(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("COMPACT")(input)?;
    Ok((input, Command::Compact))
}

// CLEAR <collection>
fn parse_clear(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("CLEAR")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, collection) = parse_collection(input)?;
    Ok((input, Command::Clear { collection }))
}

fn parse_help(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("HELP")(input)?;
    Ok((input, Command::Help))
}

fn parse_exit(input: &str) -> IResult<&str, Command> {
    let (input, _) = alt((tag_ci("EXIT"), tag_ci("QUIT")))(input)?;
    Ok((input, Command::Exit))
}

pub fn parse_command(input: &str) -> Result<Command, String> {
    let input = input.trim();
    let result = alt((
        parse_find,
        parse_context,
        parse_store,
        parse_get,
        parse_stats,
        parse_purge,
        parse_compact,
        parse_clear,
        parse_help,
        parse_exit,
    ))(input);

    match result {
        Ok((remainder, cmd)) => {
            if !remainder.trim().is_empty() {
                return Err(format!("Unexpected tokens at end: '{}'", remainder));
            }
            Ok(cmd)
        },
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let context: String = e.input.chars().take(20).collect();
            let ellipsis = if e.input.chars().count() > 20 { "..." } else { "" };
            Err(format!("Invalid syntax near: '{}{}'", context, ellipsis))
        },
        Err(nom::Err::Incomplete(_)) => Err("Incomplete command.".to_string()),
    }
}
