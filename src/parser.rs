//! implements a parser for the beanstalkd TCP protocol.
use std::fmt;

use crate::types::job::JobId;
use crate::types::protocol::BeanstalkCommand;
use crate::types::serialisable::BeanstalkSerialisable;

/// Longest permitted tube name, in bytes.
pub const MAX_TUBE_NAME_LEN: usize = 200;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsingError {
    BadFormat,
    UnknownCommand,
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::BadFormat => "bad format",
            Self::UnknownCommand => "unknown command",
        })
    }
}

impl std::error::Error for ParsingError {}

impl BeanstalkSerialisable for ParsingError {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        match self {
            ParsingError::BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            ParsingError::UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
        }
    }
}

/// Verbs recognised even when nothing follows them. Every other verb is only
/// recognised when followed by a space.
const COMMANDS_WITHOUT_PARAMS: &[&[u8]] = &[
    b"list-tubes",
    b"list-tube-used",
    b"list-tubes-watched",
    b"pause-tube",
    b"peek-buried",
    b"peek-delayed",
    b"peek-ready",
    b"quit",
    b"reserve",
    b"reserve-with-timeout",
    b"stats",
    b"stats-job",
    b"stats-tube",
];

const COMMANDS_WITH_PARAMS: &[&[u8]] = &[
    b"bury", b"delete", b"ignore", b"kick", b"kick-job", b"peek", b"put",
    b"release", b"touch", b"use", b"watch",
];

/// Provides a custom, minimal, zero-copy parser of byte slices.
///
/// The line is split on single spaces, so consecutive spaces yield empty
/// arguments, while trailing empty arguments are dropped.
struct ParseState<'a> {
    line: &'a [u8],
    verb: &'a [u8],
    args: Vec<&'a [u8]>,
    next: usize,
}

impl ParseState<'_> {
    /// Asserts there's no more input to take, returning `result` if so, and a
    /// `BadFormat` error otherwise.
    fn expect_done_and<R>(&self, result: R) -> Result<R, ParsingError> {
        if self.next == self.args.len() {
            Ok(result)
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    /// Whether a space immediately follows the verb.
    fn has_space_after_verb(&self) -> bool {
        self.line.get(self.verb.len()) == Some(&b' ')
    }

    /// Rejects a verb that takes no arguments but was followed by a space.
    fn expect_no_space_after_verb(&self) -> Result<(), ParsingError> {
        if self.has_space_after_verb() {
            Err(ParsingError::BadFormat)
        } else {
            Ok(())
        }
    }

    fn expect_space_after_verb(&self) -> Result<(), ParsingError> {
        if self.has_space_after_verb() {
            Ok(())
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    /// Rejects lines ending in whitespace.
    fn expect_no_trailing_space(&self) -> Result<(), ParsingError> {
        match self.line.last() {
            Some(c) if c.is_ascii_whitespace() => Err(ParsingError::BadFormat),
            _ => Ok(()),
        }
    }

    /// Consumes the next argument, expecting it to be non-empty.
    fn expect_next_token(&mut self) -> Result<&[u8], ParsingError> {
        let token = *self.args.get(self.next).ok_or(ParsingError::BadFormat)?;
        self.next += 1;

        if token.is_empty() {
            Err(ParsingError::BadFormat)
        } else {
            Ok(token)
        }
    }

    /// Consumes the next argument as an exact, canonical decimal: digits only,
    /// and no leading zeros unless the value is zero itself.
    fn expect_next_u64(&mut self) -> Result<u64, ParsingError> {
        let token = self.expect_next_token()?;

        if token.len() > 1 && token[0] == b'0' {
            return Err(ParsingError::BadFormat);
        }

        parse_digits(token)
    }

    /// Consumes the next argument as a u32, rejecting out-of-range values.
    fn expect_next_u32(&mut self) -> Result<u32, ParsingError> {
        self.expect_next_u64()?
            .try_into()
            .map_err(|_| ParsingError::BadFormat)
    }

    /// Consumes the next argument as a priority. Priorities wrap modulo 2^32.
    fn expect_next_pri(&mut self) -> Result<u32, ParsingError> {
        Ok(self.expect_next_u64()? as u32)
    }

    fn expect_next_id(&mut self) -> Result<JobId, ParsingError> {
        self.expect_next_u64()
    }

    /// Consumes the next argument leniently: a leading run of digits is
    /// required, and anything after it is ignored.
    fn expect_next_lenient_u64(&mut self) -> Result<u64, ParsingError> {
        let token = self.expect_next_token()?;
        let n_digits = token
            .iter()
            .position(|c| !c.is_ascii_digit())
            .unwrap_or(token.len());

        if n_digits == 0 {
            return Err(ParsingError::BadFormat);
        }

        parse_digits(&token[..n_digits])
    }

    /// Consumes the next argument as a tube name.
    fn expect_next_name(&mut self) -> Result<String, ParsingError> {
        let token = self.expect_next_token()?;

        fn char_is_name_safe(c: u8, is_first: bool) -> bool {
            match c {
                b'a'..=b'z' => true,
                b'A'..=b'Z' => true,
                b'0'..=b'9' => true,
                b'+' | b'/' | b';' | b'.' | b'$' | b'_' | b'(' | b')' => true,
                b'-' => !is_first, // - is only name safe outside first position
                _ => false,
            }
        }

        if token
            .iter()
            .enumerate()
            .all(|(i, c)| char_is_name_safe(*c, i == 0))
            && token.len() <= MAX_TUBE_NAME_LEN
        {
            // Every name-safe byte is ASCII.
            Ok(token.iter().map(|&c| char::from(c)).collect())
        } else {
            Err(ParsingError::BadFormat)
        }
    }
}

impl<'a> From<&'a [u8]> for ParseState<'a> {
    fn from(line: &'a [u8]) -> Self {
        let mut tokens = line.split(|c| *c == b' ');
        let verb = tokens.next().unwrap_or_default();
        let mut args: Vec<&[u8]> = tokens.collect();
        while args.last().is_some_and(|a| a.is_empty()) {
            args.pop();
        }

        ParseState {
            line,
            verb,
            args,
            next: 0,
        }
    }
}

/// Parses a non-empty run of ASCII digits, guarding against overflow.
fn parse_digits(token: &[u8]) -> Result<u64, ParsingError> {
    let mut r = 0u64;
    for v in token {
        match v {
            b'0'..=b'9' => {
                r = r
                    .checked_mul(10)
                    .ok_or(ParsingError::BadFormat)?
                    .checked_add((*v - b'0') as u64)
                    .ok_or(ParsingError::BadFormat)?
            },
            _ => return Err(ParsingError::BadFormat),
        };
    }

    Ok(r)
}

// Parsing is implemented to fulfil the TryFrom trait. The input is a single
// command line with its CRLF already removed.
impl TryFrom<&[u8]> for BeanstalkCommand {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        use BeanstalkCommand::*;

        let mut ps: ParseState = value.into();

        // Unknown verbs are reported before any formatting problem.
        let recognised = COMMANDS_WITHOUT_PARAMS.contains(&ps.verb)
            || (COMMANDS_WITH_PARAMS.contains(&ps.verb)
                && ps.has_space_after_verb());
        if !recognised {
            return Err(ParsingError::UnknownCommand);
        }

        let cmd = match ps.verb {
            // <cmd>
            b"list-tube-used" | b"list-tubes-watched" | b"list-tubes"
            | b"peek-buried" | b"peek-delayed" | b"peek-ready" | b"quit"
            | b"reserve" | b"stats" => {
                ps.expect_no_space_after_verb()?;
                match ps.verb {
                    b"list-tube-used" => ListTubeUsed,
                    b"list-tubes-watched" => ListTubesWatched,
                    b"list-tubes" => ListTubes,
                    b"peek-buried" => PeekBuried,
                    b"peek-delayed" => PeekDelayed,
                    b"peek-ready" => PeekReady,
                    b"quit" => Quit,
                    b"reserve" => Reserve,
                    _ => StatsServer,
                }
            },

            // <cmd> <id>
            b"delete" => Delete {
                id: ps.expect_next_id()?,
            },
            b"kick-job" => KickJob {
                id: ps.expect_next_id()?,
            },
            b"peek" => Peek {
                id: ps.expect_next_id()?,
            },
            b"touch" => Touch {
                id: ps.expect_next_id()?,
            },
            b"stats-job" => {
                ps.expect_space_after_verb()?;
                StatsJob {
                    id: ps.expect_next_id()?,
                }
            },

            // <cmd> <bound>
            b"kick" => Kick {
                bound: ps.expect_next_lenient_u64()?,
            },

            // <cmd> <timeout>
            b"reserve-with-timeout" => {
                ps.expect_space_after_verb()?;
                ReserveWithTimeout {
                    timeout: ps.expect_next_u32()?,
                }
            },

            // <cmd> <tube>
            b"use" => {
                ps.expect_no_trailing_space()?;
                Use {
                    tube: ps.expect_next_name()?,
                }
            },
            b"watch" => {
                ps.expect_no_trailing_space()?;
                Watch {
                    tube: ps.expect_next_name()?,
                }
            },
            b"ignore" => {
                ps.expect_no_trailing_space()?;
                Ignore {
                    tube: ps.expect_next_name()?,
                }
            },
            b"stats-tube" => {
                ps.expect_space_after_verb()?;
                ps.expect_no_trailing_space()?;
                StatsTube {
                    tube: ps.expect_next_name()?,
                }
            },

            // <cmd> <id> <pri>
            b"bury" => {
                ps.expect_no_trailing_space()?;
                Bury {
                    id: ps.expect_next_id()?,
                    pri: ps.expect_next_pri()?,
                }
            },

            // <cmd> <tube> <delay>
            b"pause-tube" => {
                ps.expect_no_trailing_space()?;
                PauseTube {
                    tube: ps.expect_next_name()?,
                    delay: ps.expect_next_u32()?,
                }
            },

            // <cmd> <id> <pri> <delay>
            b"release" => {
                ps.expect_no_trailing_space()?;
                Release {
                    id: ps.expect_next_id()?,
                    pri: ps.expect_next_pri()?,
                    delay: ps.expect_next_u32()?,
                }
            },

            // <cmd> <pri> <delay> <ttr> <n_bytes>
            b"put" => {
                ps.expect_no_trailing_space()?;
                Put {
                    pri: ps.expect_next_pri()?,
                    delay: ps.expect_next_u32()?,
                    ttr: ps.expect_next_u32()?,
                    n_bytes: ps.expect_next_u32()?,
                }
            },

            _ => return Err(ParsingError::UnknownCommand),
        };

        ps.expect_done_and(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        use BeanstalkCommand::*;
        use ParsingError::*;

        const U32_MAX_PLUS_1: u64 = 1 << 32;
        const U64_MAX_PLUS_1: u128 = 1 << 64;

        #[track_caller]
        fn ok(line: &[u8], res: BeanstalkCommand) {
            assert_eq!(line.try_into(), Ok(res));
        }

        #[track_caller]
        fn bf(line: &[u8]) {
            assert_eq!(
                TryInto::<BeanstalkCommand>::try_into(line),
                Err(BadFormat)
            );
        }

        #[track_caller]
        fn uc(line: &[u8]) {
            assert_eq!(
                TryInto::<BeanstalkCommand>::try_into(line),
                Err(UnknownCommand)
            );
        }

        let longest_name = "q".repeat(MAX_TUBE_NAME_LEN);
        let too_long_name = "q".repeat(MAX_TUBE_NAME_LEN + 1);

        uc(b"");
        uc(b" ");
        uc(b"frobnicate");
        uc(b"PUT 0 0 0 0");
        uc(b"reserve-job 1");

        // Verbs taking arguments are unknown without a following space.
        uc(b"delete");
        uc(b"use");
        uc(b"put");
        bf(b"pause-tube");
        bf(b"stats-job");
        bf(b"reserve-with-timeout");

        // Priorities wrap, everything else must fit.
        ok(
            b"put 1024 30 120 11",
            Put {
                pri: 1024,
                delay: 30,
                ttr: 120,
                n_bytes: 11,
            },
        );
        ok(
            format!("put {} 0 0 0", U32_MAX_PLUS_1 + 5).as_bytes(),
            Put {
                pri: 5,
                delay: 0,
                ttr: 0,
                n_bytes: 0,
            },
        );
        bf(format!("put {U64_MAX_PLUS_1} 0 0 0").as_bytes());
        for args in [
            format!("1 {U32_MAX_PLUS_1} 1 1"),
            format!("1 1 {U32_MAX_PLUS_1} 1"),
            format!("1 1 1 {U32_MAX_PLUS_1}"),
        ] {
            bf(format!("put {args}").as_bytes());
        }
        bf(b"put 0 0 0 5 ");
        bf(b"put 0 0 0");
        bf(b"put 0 0 0 5 6");
        bf(b"put -1 0 0 5");
        bf(b"put 01 0 0 5");
        bf(b"put 0  0 0 5");

        ok(
            b"use emails.out+retry_2/(eu);$x-",
            Use {
                tube: "emails.out+retry_2/(eu);$x-".into(),
            },
        );
        bf(b"use emails out");
        bf(b"use emails ");
        bf(b"use -emails");
        bf(b"use -");
        bf(b"use emails!");
        bf(b"use  emails");
        ok(
            format!("use {longest_name}").as_bytes(),
            Use {
                tube: longest_name.clone(),
            },
        );
        bf(format!("use {too_long_name}").as_bytes());

        ok(b"reserve", Reserve);
        bf(b"reserve ");
        bf(b"reserve 5");

        ok(b"reserve-with-timeout 15", ReserveWithTimeout { timeout: 15 });
        ok(b"reserve-with-timeout 0", ReserveWithTimeout { timeout: 0 });
        bf(format!("reserve-with-timeout {U32_MAX_PLUS_1}").as_bytes());
        bf(b"reserve-with-timeout abc");

        ok(b"delete 77", Delete { id: 77 });
        ok(b"delete 77 ", Delete { id: 77 });
        bf(format!("delete {U64_MAX_PLUS_1}").as_bytes());
        bf(b"delete 12abc");
        bf(b"delete 1 2");

        ok(
            b"release 4 100 5",
            Release {
                id: 4,
                pri: 100,
                delay: 5,
            },
        );
        bf(b"release 4 100");
        bf(b"release 4 100 5 ");
        ok(b"bury 4 2048", Bury { id: 4, pri: 2048 });
        bf(b"bury 4");

        ok(b"touch 4", Touch { id: 4 });
        ok(
            b"watch emails",
            Watch {
                tube: "emails".into(),
            },
        );
        ok(
            b"ignore default",
            Ignore {
                tube: "default".into(),
            },
        );

        ok(b"peek 12", Peek { id: 12 });
        ok(b"peek-ready", PeekReady);
        ok(b"peek-delayed", PeekDelayed);
        ok(b"peek-buried", PeekBuried);
        bf(b"peek-ready ");

        ok(b"kick 50", Kick { bound: 50 });
        ok(b"kick 007", Kick { bound: 7 });
        ok(b"kick 0", Kick { bound: 0 });
        ok(b"kick 12abc", Kick { bound: 12 });
        bf(b"kick abc");
        bf(b"kick ");
        ok(b"kick-job 8", KickJob { id: 8 });

        ok(b"stats-job 8", StatsJob { id: 8 });
        ok(
            b"stats-tube emails",
            StatsTube {
                tube: "emails".into(),
            },
        );
        bf(b"stats-tube emails ");
        ok(b"stats", StatsServer);

        ok(b"list-tubes", ListTubes);
        ok(b"list-tube-used", ListTubeUsed);
        ok(b"list-tubes-watched", ListTubesWatched);

        ok(b"quit", Quit);
        bf(b"quit now");

        ok(
            b"pause-tube emails 600",
            PauseTube {
                tube: "emails".into(),
                delay: 600,
            },
        );
        bf(b"pause-tube emails");
        bf(b"pause-tube emails 600 ");
    }
}
