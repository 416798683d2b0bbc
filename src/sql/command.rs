use super::lexer::{tokenize, Token};
use crate::error::{PgError, PgResult};

/// Statements handled by the session itself rather than translated to
/// SQLite: transaction control, settings and statement housekeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Begin,
    Commit,
    Rollback,
    Savepoint(String),
    Release(String),
    RollbackTo(String),
    /// `SET name TO value`; `None` means `DEFAULT`.
    Set {
        name: String,
        value: Option<String>,
        local: bool,
    },
    /// `SET TRANSACTION ...` and `SET SESSION CHARACTERISTICS ...`.
    SetTransaction,
    Show(String),
    ShowAll,
    Reset(String),
    ResetAll,
    /// `DISCARD ALL` (`all = true`) or a narrower `DISCARD` form.
    Discard { all: bool },
    /// `DEALLOCATE name`, or `DEALLOCATE ALL` when `None`.
    Deallocate(Option<String>),
}

impl Command {
    /// Command tag sent in `CommandComplete`.
    pub fn tag(&self) -> &'static str {
        match self {
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Rollback | Command::RollbackTo(_) => "ROLLBACK",
            Command::Savepoint(_) => "SAVEPOINT",
            Command::Release(_) => "RELEASE",
            Command::Set { .. } | Command::SetTransaction => "SET",
            Command::Show(_) | Command::ShowAll => "SHOW",
            Command::Reset(_) | Command::ResetAll => "RESET",
            Command::Discard { all: true } => "DISCARD ALL",
            Command::Discard { all: false } => "DISCARD",
            Command::Deallocate(None) => "DEALLOCATE ALL",
            Command::Deallocate(Some(_)) => "DEALLOCATE",
        }
    }

    /// True for the statements a failed transaction still accepts.
    pub fn ends_transaction(&self) -> bool {
        matches!(self, Command::Commit | Command::Rollback | Command::RollbackTo(_))
    }
}

const TRANSACTION_NOISE: &[&str] = &["work", "transaction"];

/// Recognizes control statements by their leading keywords.
///
/// Returns `Ok(None)` for anything that should go through the SQL
/// translator.
pub fn classify(sql: &str) -> PgResult<Option<Command>> {
    let mut tokens = tokenize(sql);
    while matches!(tokens.last(), Some(Token::Punct(';'))) {
        tokens.pop();
    }
    let Some(first) = tokens.first() else {
        return Ok(None);
    };
    let rest = &tokens[1..];
    let command = match first {
        Token::Word(w) if w == "begin" => Command::Begin,
        Token::Word(w) if w == "start" && rest.first().is_some_and(|t| t.is_word("transaction")) => {
            Command::Begin
        }
        Token::Word(w) if w == "commit" || w == "end" => {
            if rest.first().is_some_and(|t| t.is_word("prepared")) {
                return Err(PgError::unsupported("prepared transactions are not supported"));
            }
            Command::Commit
        }
        Token::Word(w) if w == "rollback" || w == "abort" => rollback(rest)?,
        Token::Word(w) if w == "savepoint" => Command::Savepoint(single_name(rest, "SAVEPOINT")?),
        Token::Word(w) if w == "release" => {
            let rest = skip_word(rest, "savepoint");
            Command::Release(single_name(rest, "RELEASE")?)
        }
        Token::Word(w) if w == "set" => set(rest)?,
        Token::Word(w) if w == "show" => show(rest)?,
        Token::Word(w) if w == "reset" => match rest {
            [t] if t.is_word("all") => Command::ResetAll,
            [_, ..] => Command::Reset(setting_name(rest)?),
            [] => return Err(PgError::syntax("syntax error at end of input")),
        },
        Token::Word(w) if w == "discard" => match rest {
            [t] if t.is_word("all") => Command::Discard { all: true },
            [t] if t.is_word("plans") || t.is_word("sequences") || t.is_word("temp") || t.is_word("temporary") => {
                Command::Discard { all: false }
            }
            _ => return Err(PgError::syntax("syntax error in DISCARD")),
        },
        Token::Word(w) if w == "deallocate" => {
            let rest = skip_word(rest, "prepare");
            match rest {
                [t] if t.is_word("all") => Command::Deallocate(None),
                [name] => Command::Deallocate(Some(name.text())),
                _ => return Err(PgError::syntax("syntax error in DEALLOCATE")),
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(command))
}

fn skip_word<'a>(tokens: &'a [Token], word: &str) -> &'a [Token] {
    match tokens.first() {
        Some(t) if t.is_word(word) => &tokens[1..],
        _ => tokens,
    }
}

fn single_name(tokens: &[Token], statement: &str) -> PgResult<String> {
    match tokens {
        [Token::Word(name)] | [Token::Quoted(name)] => Ok(name.clone()),
        _ => Err(PgError::syntax(format!("syntax error in {statement}"))),
    }
}

fn rollback(rest: &[Token]) -> PgResult<Command> {
    let rest = match rest.first() {
        Some(Token::Word(w)) if TRANSACTION_NOISE.contains(&w.as_str()) => &rest[1..],
        _ => rest,
    };
    match rest {
        [] => Ok(Command::Rollback),
        [t, ..] if t.is_word("and") => Ok(Command::Rollback),
        [t, tail @ ..] if t.is_word("to") => {
            let tail = skip_word(tail, "savepoint");
            Ok(Command::RollbackTo(single_name(tail, "ROLLBACK TO")?))
        }
        [t, ..] if t.is_word("prepared") => Err(PgError::unsupported("prepared transactions are not supported")),
        _ => Err(PgError::syntax("syntax error in ROLLBACK")),
    }
}

fn setting_name(tokens: &[Token]) -> PgResult<String> {
    let words: Vec<String> = tokens.iter().map(|t| t.text().to_ascii_lowercase()).collect();
    match words.join(" ").as_str() {
        "time zone" => Ok("timezone".to_string()),
        "transaction isolation level" => Ok("transaction_isolation".to_string()),
        "session authorization" => Ok("session_authorization".to_string()),
        "" => Err(PgError::syntax("syntax error at end of input")),
        name if !name.contains(' ') => Ok(name.to_string()),
        other => Err(PgError::syntax(format!("syntax error at or near \"{other}\""))),
    }
}

fn set(rest: &[Token]) -> PgResult<Command> {
    let (local, rest) = match rest.first() {
        Some(t) if t.is_word("local") => (true, &rest[1..]),
        Some(t) if t.is_word("session") && !rest.get(1).is_some_and(|n| n.is_word("characteristics") || n.is_word("authorization")) => {
            (false, &rest[1..])
        }
        _ => (false, rest),
    };
    match rest {
        [t, ..] if t.is_word("transaction") => return Ok(Command::SetTransaction),
        [s, c, ..] if s.is_word("session") && c.is_word("characteristics") => {
            return Ok(Command::SetTransaction)
        }
        [t, z, value @ ..] if t.is_word("time") && z.is_word("zone") => {
            return Ok(Command::Set {
                name: "timezone".to_string(),
                value: set_value(value)?,
                local,
            })
        }
        [s, a, value @ ..] if s.is_word("session") && a.is_word("authorization") => {
            return Ok(Command::Set {
                name: "session_authorization".to_string(),
                value: set_value(value)?,
                local,
            })
        }
        [t, value @ ..] if t.is_word("names") => {
            return Ok(Command::Set {
                name: "client_encoding".to_string(),
                value: set_value(value)?,
                local,
            })
        }
        _ => {}
    }

    let (name, value) = match rest {
        [name, sep, value @ ..] if sep.is_word("to") || *sep == Token::Punct('=') => (name, value),
        _ => return Err(PgError::syntax("syntax error in SET")),
    };
    let name = match name {
        Token::Word(w) | Token::Quoted(w) => w.to_ascii_lowercase(),
        _ => return Err(PgError::syntax("syntax error in SET")),
    };
    Ok(Command::Set {
        name,
        value: set_value(value)?,
        local,
    })
}

fn set_value(tokens: &[Token]) -> PgResult<Option<String>> {
    match tokens {
        [] => Err(PgError::syntax("syntax error at end of input")),
        [t] if t.is_word("default") || t.is_word("local") => Ok(None),
        _ => {
            let parts: Vec<String> = tokens
                .iter()
                .filter(|t| **t != Token::Punct(','))
                .map(Token::text)
                .collect();
            Ok(Some(parts.join(", ")))
        }
    }
}

fn show(rest: &[Token]) -> PgResult<Command> {
    match rest {
        [t] if t.is_word("all") => Ok(Command::ShowAll),
        _ => Ok(Command::Show(setting_name(rest)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(sql: &str) -> Command {
        classify(sql).unwrap().unwrap()
    }

    #[test]
    fn transaction_control() {
        assert_eq!(cmd("BEGIN"), Command::Begin);
        assert_eq!(cmd("begin transaction isolation level serializable"), Command::Begin);
        assert_eq!(cmd("START TRANSACTION"), Command::Begin);
        assert_eq!(cmd("COMMIT WORK;"), Command::Commit);
        assert_eq!(cmd("END"), Command::Commit);
        assert_eq!(cmd("ABORT"), Command::Rollback);
        assert_eq!(cmd("SAVEPOINT sp1"), Command::Savepoint("sp1".into()));
        assert_eq!(cmd("RELEASE SAVEPOINT sp1"), Command::Release("sp1".into()));
        assert_eq!(cmd("ROLLBACK TO SAVEPOINT sp1"), Command::RollbackTo("sp1".into()));
        assert_eq!(cmd("rollback transaction to sp1"), Command::RollbackTo("sp1".into()));
    }

    #[test]
    fn settings() {
        assert_eq!(
            cmd("SET application_name = 'psql'"),
            Command::Set {
                name: "application_name".into(),
                value: Some("psql".into()),
                local: false
            }
        );
        assert_eq!(
            cmd("SET LOCAL search_path TO public, \"$user\""),
            Command::Set {
                name: "search_path".into(),
                value: Some("public, $user".into()),
                local: true
            }
        );
        assert_eq!(
            cmd("SET TIME ZONE 'UTC'"),
            Command::Set {
                name: "timezone".into(),
                value: Some("UTC".into()),
                local: false
            }
        );
        assert_eq!(
            cmd("set datestyle to default"),
            Command::Set {
                name: "datestyle".into(),
                value: None,
                local: false
            }
        );
        assert_eq!(cmd("SET TRANSACTION ISOLATION LEVEL READ COMMITTED"), Command::SetTransaction);
        assert_eq!(cmd("SHOW TRANSACTION ISOLATION LEVEL"), Command::Show("transaction_isolation".into()));
        assert_eq!(cmd("SHOW ALL"), Command::ShowAll);
        assert_eq!(cmd("RESET ALL"), Command::ResetAll);
    }

    #[test]
    fn housekeeping() {
        assert_eq!(cmd("DISCARD ALL"), Command::Discard { all: true });
        assert_eq!(cmd("DEALLOCATE PREPARE s1"), Command::Deallocate(Some("s1".into())));
        assert_eq!(cmd("DEALLOCATE ALL"), Command::Deallocate(None));
        assert_eq!(Command::Deallocate(None).tag(), "DEALLOCATE ALL");
    }

    #[test]
    fn other_statements_pass_through() {
        assert_eq!(classify("SELECT 1").unwrap(), None);
        assert_eq!(classify("INSERT INTO begin_log VALUES (1)").unwrap(), None);
        assert!(classify("SET").is_err());
    }
}
