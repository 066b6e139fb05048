use self::Token::*;
use anyhow::{bail, Result};
use std::str::Chars;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Colon,
    Directive(String),
    EndOfFile,
    False,
    Float(f64),
    Identifier(String),
    Illegal(String),
    Integer(i64),
    LabelRef(String),
    Newline,
    Str(String),
    True,
}

pub const EOF_CHAR: char = '\0';

/// Tokenizer for the assembly syntax. Line breaks are tokens; `;` starts a
/// comment that runs to the end of the line.
pub struct Lexer<'a> {
    chars: Chars<'a>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Lexer<'a> {
        Self {
            chars: input.chars(),
        }
    }

    pub fn next_token(&mut self) -> Result<Token> {
        self.skip_while(Self::is_whitespace);
        if self.peek_nth(0) == ';' {
            self.skip_while(|c| c != '\n');
        }

        let first_char = self.read_char();
        let token = match first_char {
            '\n' => Newline,
            ':' => Colon,
            '"' => {
                let text = self.take_while(|c| c != '"' && c != '\n');
                if self.read_char() != '"' {
                    bail!("unterminated string \"{}", text);
                }
                Str(text)
            }
            '<' => {
                let name = self.take_while(|c| c != '>' && c != '\n');
                if self.read_char() != '>' {
                    bail!("unterminated label reference <{}", name);
                }
                LabelRef(name)
            }
            '.' if Self::is_letter(self.peek_nth(0)) => {
                Directive(self.take_while(Self::is_identifier))
            }
            EOF_CHAR if self.is_eof() => EndOfFile,
            c if Self::is_letter(c) => {
                let mut identifier = c.to_string();
                identifier.push_str(&self.take_while(Self::is_identifier));
                Self::lookup_identifier(&identifier)
            }
            c if Self::is_digit(c) || c == '-' || c == '+' || c == '.' => self.read_number(c)?,
            illegal => Illegal(illegal.to_string()),
        };
        Ok(token)
    }

    pub fn exhaust(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let next_token = self.next_token()?;
            if let Token::EndOfFile = next_token {
                break;
            }
            tokens.push(next_token);
        }
        Ok(tokens)
    }

    fn read_number(&mut self, first: char) -> Result<Token> {
        let mut number = first.to_string();
        if (first == '-' || first == '+') && Self::is_letter(self.peek_nth(0)) {
            let word = self.take_while(Self::is_identifier);
            return match word.to_ascii_lowercase().as_str() {
                "inf" | "infinity" => Ok(Float(if first == '-' {
                    f64::NEG_INFINITY
                } else {
                    f64::INFINITY
                })),
                _ => Ok(Illegal(format!("{}{}", first, word))),
            };
        }

        number.push_str(&self.take_while(Self::is_digit));
        let mut is_float = first == '.';
        if self.peek_nth(0) == '.' && first != '.' {
            is_float = true;
            number.push(self.read_char());
            number.push_str(&self.take_while(Self::is_digit));
        }
        if matches!(self.peek_nth(0), 'e' | 'E') {
            is_float = true;
            number.push(self.read_char());
            if matches!(self.peek_nth(0), '-' | '+') {
                number.push(self.read_char());
            }
            number.push_str(&self.take_while(Self::is_digit));
        }

        if is_float {
            match number.parse::<f64>() {
                Ok(value) => Ok(Float(value)),
                Err(_) => bail!("invalid float literal {}", number),
            }
        } else {
            match number.parse::<i64>() {
                Ok(value) => Ok(Integer(value)),
                Err(_) => bail!("invalid integer literal {}", number),
            }
        }
    }

    fn read_char(&mut self) -> char {
        self.chars.next().unwrap_or(EOF_CHAR)
    }

    fn peek_nth(&self, n: usize) -> char {
        self.chars.clone().nth(n).unwrap_or(EOF_CHAR)
    }

    fn is_eof(&self) -> bool {
        self.chars.as_str().is_empty()
    }

    fn take_while(&mut self, mut predicate: impl FnMut(char) -> bool) -> String {
        let mut chars = String::new();
        while predicate(self.peek_nth(0)) && !self.is_eof() {
            chars.push(self.read_char());
        }
        chars
    }

    fn skip_while(&mut self, mut predicate: impl FnMut(char) -> bool) {
        while predicate(self.peek_nth(0)) && !self.is_eof() {
            self.read_char();
        }
    }

    fn is_letter(c: char) -> bool {
        c.is_ascii_alphabetic() || c == '_'
    }

    fn is_identifier(c: char) -> bool {
        Self::is_letter(c) || Self::is_digit(c)
    }

    fn is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    fn is_whitespace(c: char) -> bool {
        c == ' ' || c == '\t' || c == '\r'
    }

    fn lookup_identifier(identifier: &str) -> Token {
        match identifier {
            "true" => True,
            "false" => False,
            "inf" => Float(f64::INFINITY),
            "NaN" | "nan" => Float(f64::NAN),
            _ => Identifier(identifier.to_string()),
        }
    }
}
