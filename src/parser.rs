use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_until, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{map, map_res, opt, recognize},
    multi::separated_list0,
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

use crate::name::Name;

#[derive(Debug, PartialEq, Clone)]
pub enum Filter {
    Equals { index: String, value: String },
    Between { index: String, lower: String, upper: String },
}

#[derive(Debug, PartialEq, Clone)]
pub enum Command {
    Add { timed: bool, creator: Name, testid: Name, description: String, results: Vec<f64> },
    Clear { timed: bool, user: Option<Name> },
    Select { timed: bool, filter: Option<Filter>, limit: Option<usize> },
    Get { timed: bool, id: u64 },
    Help,
    Exit,
}

// --- BASIC PARSERS ---

fn parse_float(input: &str) -> IResult<&str, f64> {
    let (input, num_str) = recognize(tuple((
        opt(char('-')),
        digit1,
        opt(tuple((char('.'), digit1))),
    )))(input)?;
    match num_str.parse::<f64>() {
        Ok(n) => Ok((input, n)),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Float))),
    }
}

fn parse_u64(input: &str) -> IResult<&str, u64> {
    map_res(digit1, |s: &str| s.parse::<u64>())(input)
}

fn parse_results(input: &str) -> IResult<&str, Vec<f64>> {
    delimited(
        pair(char('['), multispace0),
        separated_list0(ws(char(',')), parse_float),
        pair(multispace0, char(']')),
    )(input)
}

fn parse_quoted_string(input: &str) -> IResult<&str, String> {
    let (input, _) = char('"')(input)?;
    let (input, content) = take_until("\"")(input)?;
    let (input, _) = char('"')(input)?;
    Ok((input, content.to_string()))
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_lowercase() || ('1'..='5').contains(&c) || c == '.'
}

fn parse_name(input: &str) -> IResult<&str, Name> {
    map_res(take_while1(is_name_char), Name::new)(input)
}

fn parse_word(input: &str) -> IResult<&str, String> {
    map(take_while1(|c: char| c.is_ascii_alphanumeric() || c == '.' || c == '_'), String::from)(input)
}

// --- HELPERS ---
fn ws<'a, F, O, E: nom::error::ParseError<&'a str>>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where F: FnMut(&'a str) -> IResult<&'a str, O, E> {
    delimited(multispace0, inner, multispace0)
}

fn tag_ci(t: &'static str) -> impl FnMut(&str) -> IResult<&str, &str> {
    move |input| tag_no_case(t)(input)
}

fn parse_timed(input: &str) -> IResult<&str, bool> {
    map(opt(terminated(tag_ci("TIMED"), multispace1)), |t| t.is_some())(input)
}

fn parse_tests(input: &str) -> IResult<&str, &str> {
    alt((tag_ci("TESTS"), tag_ci("TEST")))(input)
}

// --- COMMAND PARSERS ---

fn parse_add(input: &str) -> IResult<&str, Command> {
    let (input, _) = alt((tag_ci("ADD"), tag_ci("INSERT")))(input)?;
    let (input, _) = multispace1(input)?;
    let (input, timed) = parse_timed(input)?;
    let (input, _) = parse_tests(input)?;
    let (input, _) = multispace1(input)?;
    let (input, creator) = parse_name(input)?;
    let (input, _) = multispace1(input)?;
    let (input, testid) = parse_name(input)?;
    let (input, description) = opt(preceded(multispace1, parse_quoted_string))(input)?;
    let (input, results) = opt(preceded(multispace0, parse_results))(input)?;

    Ok((input, Command::Add {
        timed,
        creator,
        testid,
        description: description.unwrap_or_default(),
        results: results.unwrap_or_default(),
    }))
}

fn parse_clear(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("CLEAR")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, timed) = parse_timed(input)?;
    let (input, _) = parse_tests(input)?;
    let (input, user) = opt(preceded(multispace1, parse_name))(input)?;
    Ok((input, Command::Clear { timed, user }))
}

fn parse_filter(input: &str) -> IResult<&str, Filter> {
    let (input, index) = parse_word(input)?;
    let res = alt((
        map(preceded(ws(char('=')), parse_word), |value| Filter::Equals {
            index: index.clone(),
            value,
        }),
        map(
            tuple((ws(tag_ci("BETWEEN")), parse_word, ws(tag_ci("AND")), parse_word)),
            |(_, lower, _, upper)| Filter::Between {
                index: index.clone(),
                lower,
                upper,
            },
        ),
    ))(input);
    res
}

fn parse_select(input: &str) -> IResult<&str, Command> {
    let (input, _) = alt((tag_ci("SELECT"), tag_ci("FIND")))(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = opt(terminated(tag_ci("FROM"), multispace1))(input)?;
    let (input, timed) = parse_timed(input)?;
    let (input, _) = parse_tests(input)?;

    let (input, filter) = opt(preceded(ws(tag_ci("WHERE")), parse_filter))(input)?;

    let (input, limit) = opt(preceded(
        ws(tag_ci("LIMIT")),
        map_res(digit1, |s: &str| s.parse::<usize>()),
    ))(input)?;

    Ok((input, Command::Select { timed, filter, limit }))
}

fn parse_get(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("GET")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, timed) = parse_timed(input)?;
    let (input, _) = parse_tests(input)?;
    let (input, _) = multispace1(input)?;
    let (input, id) = parse_u64(input)?;
    Ok((input, Command::Get { timed, id }))
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
        parse_add,
        parse_clear,
        parse_select,
        parse_get,
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
            if context.len() < e.input.len() {
                Err(format!("Invalid syntax near: '{}...'", context))
            } else {
                Err(format!("Invalid syntax near: '{}'", context))
            }
        },
        Err(nom::Err::Incomplete(_)) => Err("Incomplete command.".to_string()),
    }
}
