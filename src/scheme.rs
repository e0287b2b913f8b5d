//! Source text to s-expressions.
//!
//! [`tokenize`] turns text into a flat sequence of [`Token`]s and [`parse`] folds that
//! sequence into top-level data with a bracket-matching stack. The parser output only
//! contains atoms, pairs and the empty list.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, digit0, digit1, multispace0, multispace1, one_of},
    combinator::{all_consuming, opt, recognize, value},
    multi::many0_count,
    sequence::pair,
};

use crate::ast::{NumberType, Value};
use crate::{Error, MAX_PARSE_DEPTH, ParseError, ParseErrorKind};

/// Lexer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseConfig {
    /// Treat `;` as the start of a comment running to the end of the line
    pub handle_comments: bool,
}

impl Default for ParseConfig {
    fn default() -> Self {
        ParseConfig {
            handle_comments: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bracket {
    Round,
    Square,
}

impl Bracket {
    fn closer(self) -> char {
        match self {
            Bracket::Round => ')',
            Bracket::Square => ']',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Open(Bracket),
    Close(Bracket),
    Quote,
    Dot,
    Integer(NumberType),
    Real(f64),
    String(String),
    Bool(bool),
    Symbol(String),
}

/// A lexical token and the byte offset where it starts in the source
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub offset: usize,
}

/// Characters that may start a symbol besides letters
const SYMBOL_INITIAL_CHARS: &str = "!$%&*/:<=>?~_^";

/// Characters that may continue a symbol besides initials and digits
const SYMBOL_SUBSEQUENT_CHARS: &str = "+-.";

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '[' | ']' | '\'' | '"' | ';')
}

fn is_symbol_initial(c: char) -> bool {
    c.is_alphabetic() || SYMBOL_INITIAL_CHARS.contains(c)
}

fn is_symbol_subsequent(c: char) -> bool {
    is_symbol_initial(c) || c.is_ascii_digit() || SYMBOL_SUBSEQUENT_CHARS.contains(c)
}

/// Lexer failure, positioned by the unconsumed input at the point of failure
struct LexError<'a> {
    kind: ParseErrorKind,
    message: String,
    at: &'a str,
    found: Option<String>,
}

impl<'a> LexError<'a> {
    fn invalid(message: impl Into<String>, at: &'a str, found: &str) -> Self {
        LexError {
            kind: ParseErrorKind::InvalidSyntax,
            message: message.into(),
            at,
            found: Some(found.to_owned()),
        }
    }

    fn into_parse_error(self, source: &str) -> ParseError {
        let offset = source.len() - self.at.len();
        error_at(source, self.kind, self.message, offset, self.found)
    }
}

/// Build a positioned ParseError. Token offsets are byte offsets; the context snippet
/// is taken by character position.
fn error_at(
    source: &str,
    kind: ParseErrorKind,
    message: impl Into<String>,
    offset: usize,
    found: Option<String>,
) -> ParseError {
    let char_offset = source
        .get(..offset)
        .map_or(offset, |prefix| prefix.chars().count());
    let message = format!("{} at position {char_offset}", message.into());
    ParseError::with_context_and_found(kind, message, source, char_offset, found)
}

fn comment(input: &str) -> IResult<&str, &str> {
    recognize(pair(char(';'), take_while(|c: char| c != '\n'))).parse(input)
}

/// Skip whitespace, and comments when enabled
fn atmosphere(input: &str, config: ParseConfig) -> IResult<&str, ()> {
    if config.handle_comments {
        value((), many0_count(alt((multispace1, comment)))).parse(input)
    } else {
        value((), multispace0).parse(input)
    }
}

fn punctuation(input: &str) -> IResult<&str, TokenKind> {
    alt((
        value(TokenKind::Open(Bracket::Round), char('(')),
        value(TokenKind::Close(Bracket::Round), char(')')),
        value(TokenKind::Open(Bracket::Square), char('[')),
        value(TokenKind::Close(Bracket::Square), char(']')),
        value(TokenKind::Quote, char('\'')),
    ))
    .parse(input)
}

/// Decimal literal: optional sign, digits with an optional fraction, or a bare fraction
fn decimal(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        opt(one_of("+-")),
        alt((
            recognize(pair(digit1, opt(pair(char('.'), digit0)))),
            recognize(pair(char('.'), digit1)),
        )),
    ))
    .parse(input)
}

/// Whether an atom starts like a number, so a failed number parse is reported as such
fn looks_numeric(atom: &str) -> bool {
    let unsigned = atom.strip_prefix(['+', '-']).unwrap_or(atom);
    let unsigned = unsigned.strip_prefix('.').unwrap_or(unsigned);
    unsigned.starts_with(|c: char| c.is_ascii_digit())
}

fn is_valid_symbol(atom: &str) -> bool {
    if matches!(atom, "+" | "-" | "...") {
        return true;
    }
    let mut chars = atom.chars();
    chars.next().is_some_and(is_symbol_initial) && chars.all(is_symbol_subsequent)
}

/// Classify a delimiter-bounded chunk of non-string text
fn classify_atom(atom: &str) -> Result<TokenKind, LexError<'_>> {
    if atom == "." {
        return Ok(TokenKind::Dot);
    }

    if atom.starts_with('#') {
        return match atom {
            "#t" | "#true" => Ok(TokenKind::Bool(true)),
            "#f" | "#false" => Ok(TokenKind::Bool(false)),
            _ => Err(LexError::invalid("Unknown # syntax", atom, atom)),
        };
    }

    // The grammar only validates; the whole atom is the literal's text
    if all_consuming(decimal).parse(atom).is_ok() {
        if atom.contains('.') {
            return atom
                .parse::<f64>()
                .map(TokenKind::Real)
                .map_err(|_| LexError::invalid("Malformed number", atom, atom));
        }
        return atom.parse::<NumberType>().map(TokenKind::Integer).map_err(|_| LexError {
            kind: ParseErrorKind::ImplementationLimit,
            message: format!("Integer literal does not fit in {} bits", NumberType::BITS),
            at: atom,
            found: Some(atom.to_owned()),
        });
    }

    if looks_numeric(atom) {
        return Err(LexError::invalid("Malformed number", atom, atom));
    }

    if is_valid_symbol(atom) {
        Ok(TokenKind::Symbol(atom.to_owned()))
    } else {
        Err(LexError::invalid("Invalid identifier", atom, atom))
    }
}

/// Lex a string literal starting at the opening quote
fn lex_string(input: &str) -> Result<(&str, TokenKind), LexError<'_>> {
    let mut chars = input.char_indices().skip(1);
    let mut text = String::new();

    while let Some((index, ch)) = chars.next() {
        match ch {
            '"' => return Ok((&input[index + 1..], TokenKind::String(text))),
            '\\' => match chars.next() {
                Some((_, 'n')) => text.push('\n'),
                Some((_, 't')) => text.push('\t'),
                Some((_, 'r')) => text.push('\r'),
                Some((_, '\\')) => text.push('\\'),
                Some((_, '"')) => text.push('"'),
                Some((_, other)) => {
                    return Err(LexError::invalid(
                        "Unknown escape sequence in string",
                        &input[index..],
                        &format!("\\{other}"),
                    ));
                }
                None => break,
            },
            _ => text.push(ch),
        }
    }

    Err(LexError {
        kind: ParseErrorKind::Incomplete,
        message: "Unterminated string literal".to_owned(),
        at: input,
        found: None,
    })
}

fn lex_token(input: &str) -> Result<(&str, TokenKind), LexError<'_>> {
    if let Ok((rest, kind)) = punctuation(input) {
        return Ok((rest, kind));
    }

    if input.starts_with('"') {
        let (rest, kind) = lex_string(input)?;
        // A string must be separated from a following atom
        if rest.starts_with(|c: char| !is_delimiter(c)) {
            return Err(LexError::invalid(
                "Expected delimiter after string literal",
                rest,
                &rest.chars().take(10).collect::<String>(),
            ));
        }
        return Ok((rest, kind));
    }

    let (rest, atom) = take_while1::<_, _, nom::error::Error<&str>>(|c: char| !is_delimiter(c))
        .parse(input)
        .map_err(|_| {
            let found: String = input.chars().take(1).collect();
            LexError::invalid("Unexpected character", input, &found)
        })?;
    let kind = classify_atom(atom).map_err(|err| LexError { at: input, ..err })?;
    Ok((rest, kind))
}

/// Tokenize `source` with the default configuration (comments enabled)
pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    tokenize_with_config(source, ParseConfig::default())
}

pub fn tokenize_with_config(source: &str, config: ParseConfig) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut input = source;

    loop {
        // atmosphere never fails: both alternatives accept empty input
        if let Ok((rest, ())) = atmosphere(input, config) {
            input = rest;
        }
        if input.is_empty() {
            break;
        }

        let offset = source.len() - input.len();
        let (rest, kind) = lex_token(input).map_err(|err| err.into_parse_error(source))?;
        tokens.push(Token { kind, offset });
        input = rest;
    }

    Ok(tokens)
}

/// What follows the dot of a list under construction
enum DottedTail {
    None,
    Awaiting { dot_offset: usize },
    Complete(Value),
}

/// An open construct on the parser stack
enum Pending {
    List {
        bracket: Bracket,
        offset: usize,
        items: Vec<Value>,
        tail: DottedTail,
    },
    Quote {
        offset: usize,
    },
}

struct StackParser<'a> {
    /// Source text, when known, for error context snippets
    source: Option<&'a str>,
    stack: Vec<Pending>,
    program: Vec<Value>,
}

impl<'a> StackParser<'a> {
    fn new(source: Option<&'a str>) -> Self {
        StackParser {
            source,
            stack: Vec::new(),
            program: Vec::new(),
        }
    }

    fn error(
        &self,
        kind: ParseErrorKind,
        message: &str,
        offset: usize,
        found: Option<String>,
    ) -> ParseError {
        match self.source {
            Some(source) => error_at(source, kind, message, offset, found),
            None => ParseError::new(kind, format!("{message} at offset {offset}"), None, found),
        }
    }

    fn open(&mut self, pending: Pending, offset: usize) -> Result<(), ParseError> {
        if self.stack.len() >= MAX_PARSE_DEPTH {
            return Err(self.error(
                ParseErrorKind::TooDeeplyNested,
                &format!("Expression too deeply nested (max depth: {MAX_PARSE_DEPTH})"),
                offset,
                None,
            ));
        }
        self.stack.push(pending);
        Ok(())
    }

    /// Hand a finished datum to the innermost open construct, closing any quotes
    /// it completes; at the top level it becomes the next program form
    fn push_datum(&mut self, datum: Value, offset: usize) -> Result<(), ParseError> {
        let mut datum = datum;
        loop {
            match self.stack.last_mut() {
                None => {
                    self.program.push(datum);
                    return Ok(());
                }
                Some(Pending::List { items, tail, .. }) => {
                    match tail {
                        DottedTail::None => items.push(datum),
                        DottedTail::Awaiting { .. } => *tail = DottedTail::Complete(datum),
                        DottedTail::Complete(_) => break,
                    }
                    return Ok(());
                }
                Some(Pending::Quote { .. }) => {}
            }
            self.stack.pop();
            datum = Value::list(vec![Value::Symbol("quote".to_owned()), datum]);
        }

        Err(self.error(
            ParseErrorKind::InvalidSyntax,
            "More than one datum after dot",
            offset,
            Some(datum.to_string()),
        ))
    }

    fn close(&mut self, closer: Bracket, offset: usize) -> Result<(), ParseError> {
        let found = Some(closer.closer().to_string());
        match self.stack.pop() {
            Some(Pending::List {
                bracket,
                items,
                tail,
                ..
            }) => {
                if bracket != closer {
                    return Err(self.error(
                        ParseErrorKind::InvalidSyntax,
                        &format!("Mismatched bracket: expected '{}'", bracket.closer()),
                        offset,
                        found,
                    ));
                }
                let list = match tail {
                    DottedTail::None => Value::list(items),
                    DottedTail::Complete(last) => Value::improper_list(items, last),
                    DottedTail::Awaiting { dot_offset } => {
                        return Err(self.error(
                            ParseErrorKind::InvalidSyntax,
                            "Expected a datum after dot",
                            dot_offset,
                            found,
                        ));
                    }
                };
                self.push_datum(list, offset)
            }
            Some(Pending::Quote { .. }) => Err(self.error(
                ParseErrorKind::InvalidSyntax,
                "Quote must be followed by a datum",
                offset,
                found,
            )),
            None => Err(self.error(
                ParseErrorKind::InvalidSyntax,
                "Unexpected closing bracket",
                offset,
                found,
            )),
        }
    }

    fn dot(&mut self, offset: usize) -> Result<(), ParseError> {
        if let Some(Pending::List { items, tail, .. }) = self.stack.last_mut()
            && !items.is_empty()
            && matches!(tail, DottedTail::None)
        {
            *tail = DottedTail::Awaiting { dot_offset: offset };
            return Ok(());
        }
        Err(self.error(
            ParseErrorKind::InvalidSyntax,
            "Unexpected dot",
            offset,
            Some(".".to_owned()),
        ))
    }

    fn token(&mut self, token: &Token) -> Result<(), ParseError> {
        let offset = token.offset;
        let atom = match &token.kind {
            TokenKind::Open(bracket) => {
                return self.open(
                    Pending::List {
                        bracket: *bracket,
                        offset,
                        items: Vec::new(),
                        tail: DottedTail::None,
                    },
                    offset,
                );
            }
            TokenKind::Quote => return self.open(Pending::Quote { offset }, offset),
            TokenKind::Close(bracket) => return self.close(*bracket, offset),
            TokenKind::Dot => return self.dot(offset),
            TokenKind::Integer(n) => Value::Integer(*n),
            TokenKind::Real(r) => Value::Real(*r),
            TokenKind::String(s) => Value::from(s.as_str()),
            TokenKind::Bool(b) => Value::Bool(*b),
            TokenKind::Symbol(name) => Value::Symbol(name.clone()),
        };
        self.push_datum(atom, offset)
    }

    fn finish(self) -> Result<Vec<Value>, ParseError> {
        match self.stack.last() {
            None => Ok(self.program),
            Some(Pending::List {
                bracket, offset, ..
            }) => Err(self.error(
                ParseErrorKind::Incomplete,
                &format!("Missing closing '{}'", bracket.closer()),
                *offset,
                None,
            )),
            Some(Pending::Quote { offset }) => Err(self.error(
                ParseErrorKind::Incomplete,
                "Quote must be followed by a datum",
                *offset,
                None,
            )),
        }
    }
}

fn parse_tokens(tokens: &[Token], source: Option<&str>) -> Result<Vec<Value>, ParseError> {
    let mut parser = StackParser::new(source);
    for token in tokens {
        parser.token(token)?;
    }
    parser.finish()
}

/// Fold a token sequence into top-level data
pub fn parse(tokens: &[Token]) -> Result<Vec<Value>, ParseError> {
    parse_tokens(tokens, None)
}

/// Tokenize and parse a whole program
pub fn parse_program(source: &str) -> Result<Vec<Value>, Error> {
    parse_program_with_config(source, ParseConfig::default())
}

pub fn parse_program_with_config(source: &str, config: ParseConfig) -> Result<Vec<Value>, Error> {
    let tokens = tokenize_with_config(source, config)?;
    let program = parse_tokens(&tokens, Some(source))?;
    log::trace!("parsed {} tokens into {} forms", tokens.len(), program.len());
    Ok(program)
}

/// Parse exactly one datum from `source`
pub fn parse_scheme(source: &str) -> Result<Value, Error> {
    parse_scheme_with_config(source, ParseConfig::default())
}

pub fn parse_scheme_with_config(source: &str, config: ParseConfig) -> Result<Value, Error> {
    let tokens = tokenize_with_config(source, config)?;
    let mut program = parse_tokens(&tokens, Some(source))?.into_iter();

    let Some(datum) = program.next() else {
        return Err(ParseError::from_message(ParseErrorKind::Incomplete, "Empty input").into());
    };
    if let Some(extra) = program.next() {
        return Err(ParseError::new(
            ParseErrorKind::TrailingContent,
            "Unexpected remaining input after expression",
            None,
            Some(extra.to_string()),
        )
        .into());
    }
    Ok(datum)
}
