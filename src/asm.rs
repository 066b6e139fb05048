use crate::{Bytecode, BytecodeBuilder, Function, Lexer, OperandKind, Opcode, Token};
use anyhow::{bail, Context, Result};

pub const DEFAULT_CHUNK: &str = "main";

/// Assembles source in the disassembler's syntax into chunks.
///
/// ```text
/// .chunk main
/// entry:
///     pushi 2
///     pushi 3
///     addi
///     run "print_value"
///     jmp <entry>
/// ```
///
/// Instructions before the first `.chunk` directive go to a chunk named
/// `main`. Labels may be referenced before they are placed.
pub fn assemble(source: &str) -> Result<Vec<Bytecode>> {
    let tokens = Lexer::new(source).exhaust()?;
    let mut assembler = Assembler::default();
    for (index, line) in tokens.split(|token| *token == Token::Newline).enumerate() {
        assembler
            .line(line)
            .with_context(|| format!("line {}", index + 1))?;
    }
    assembler.finish()
}

/// Assembles `source` as the body of a single chunk called `name`.
pub fn assemble_chunk(name: &str, source: &str) -> Result<Bytecode> {
    let tokens = Lexer::new(source).exhaust()?;
    let mut assembler = Assembler::default();
    assembler.builder = Some(BytecodeBuilder::new(name));
    for (index, line) in tokens.split(|token| *token == Token::Newline).enumerate() {
        if let Some(Token::Directive(_)) = line.first() {
            bail!("line {}: directives are not allowed here", index + 1);
        }
        assembler
            .line(line)
            .with_context(|| format!("line {}", index + 1))?;
    }
    let mut chunks = assembler.finish()?;
    chunks.pop().context("no chunk was assembled")
}

#[derive(Default)]
struct Assembler {
    chunks: Vec<Bytecode>,
    builder: Option<BytecodeBuilder>,
}

impl Assembler {
    fn line(&mut self, line: &[Token]) -> Result<()> {
        match line {
            [] => Ok(()),
            [Token::Directive(directive), Token::Identifier(name)] if directive == "chunk" => {
                self.flush()?;
                self.builder = Some(BytecodeBuilder::new(name));
                Ok(())
            }
            [Token::Directive(directive), ..] => bail!("unknown directive .{}", directive),
            [Token::Identifier(name), Token::Colon] => self.label(name),
            [Token::Identifier(mnemonic), operands @ ..] => self.instruction(mnemonic, operands),
            [token, ..] => bail!("unexpected {:?}", token),
        }
    }

    fn builder(&mut self) -> &mut BytecodeBuilder {
        self.builder
            .get_or_insert_with(|| BytecodeBuilder::new(DEFAULT_CHUNK))
    }

    fn label(&mut self, name: &str) -> Result<()> {
        let builder = self.builder();
        match builder.find_label(name) {
            Some(label) => builder.place_label(label)?,
            None => {
                builder.push_label(name);
            }
        }
        Ok(())
    }

    fn instruction(&mut self, mnemonic: &str, operands: &[Token]) -> Result<()> {
        let opcode = match Opcode::from_mnemonic(mnemonic) {
            Some(opcode) => opcode,
            None => bail!("unknown instruction {}", mnemonic),
        };
        let builder = self.builder();

        match (opcode.operand(), operands) {
            (None, []) => builder.push_op(opcode)?,
            (None, [operand, ..]) => bail!("{} takes no operand, got {:?}", opcode, operand),
            (Some(kind), []) => bail!("{} requires a {} operand", opcode, kind),
            (Some(_), [_, extra, ..]) => bail!("unexpected {:?} after operand", extra),
            (Some(kind), [operand]) => {
                match (kind, operand) {
                    (OperandKind::Int, Token::Integer(value)) => {
                        builder.push_op_int(opcode, *value)?;
                    }
                    (OperandKind::Float, Token::Float(value)) => {
                        builder.push_op_float(opcode, *value)?;
                    }
                    (OperandKind::Float, Token::Integer(value)) => {
                        builder.push_op_float(opcode, *value as f64)?;
                    }
                    (OperandKind::Bool, Token::True) => {
                        builder.push_op_bool(opcode, true)?;
                    }
                    (OperandKind::Bool, Token::False) => {
                        builder.push_op_bool(opcode, false)?;
                    }
                    (OperandKind::Func, Token::Str(hint)) => {
                        builder.push_op_func(opcode, Function::by_hint(hint))?;
                    }
                    (OperandKind::Label, Token::LabelRef(name)) => {
                        let label = match builder.find_label(name) {
                            Some(label) => label,
                            None => builder.declare_label(name),
                        };
                        builder.push_op_label(opcode, label)?;
                    }
                    (kind, operand) => bail!("{} expects a {} operand, got {:?}", opcode, kind, operand),
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(builder) = self.builder.take() {
            let name = builder.name().to_string();
            let chunk = builder
                .build()
                .with_context(|| format!("failed to build chunk \"{}\"", name))?;
            self.chunks.push(chunk);
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<Bytecode>> {
        self.flush()?;
        Ok(self.chunks)
    }
}
