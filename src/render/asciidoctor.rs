//! Renders blocks by piping them through the `asciidoctor` command.

use super::{BlockRender, RenderError, RendererFactory};
use std::io::Write;
use std::process::{Command, Stdio};

/// Embedded output on stdout, reading the document from stdin.
pub const DEFAULT_ARGS: &[&str] = &["-s", "-e", "-a", "showtitle", "-o", "-", "-"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciidoctorCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for AsciidoctorCommand {
    fn default() -> Self {
        Self {
            program: "asciidoctor".to_string(),
            args: DEFAULT_ARGS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl AsciidoctorCommand {
    /// Parses a shell-style command line. A bare program name gets the
    /// default arguments appended.
    pub fn parse(command: &str) -> Result<Self, RenderError> {
        let mut parts = shell_words::split(command)
            .map_err(|err| {
                RenderError::Backend(format!("invalid renderer command `{command}`: {err}"))
            })?;
        if parts.is_empty() {
            return Err(RenderError::Backend("renderer command is empty".to_string()));
        }
        let program = parts.remove(0);
        let args = if parts.is_empty() {
            DEFAULT_ARGS.iter().map(|s| s.to_string()).collect()
        } else {
            parts
        };
        Ok(Self { program, args })
    }
}

pub struct Asciidoctor {
    command: AsciidoctorCommand,
}

impl Asciidoctor {
    pub fn new(command: AsciidoctorCommand) -> Self {
        Self { command }
    }
}

impl BlockRender for Asciidoctor {
    fn render(&mut self, source: &str) -> Result<String, RenderError> {
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RenderError::Spawn {
                program: self.command.program.clone(),
                source,
            })?;

        // Write from a separate thread so a large block cannot deadlock
        // against a full stdout pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            let input = source.to_string();
            std::thread::spawn(move || stdin.write_all(input.as_bytes()))
        });

        let output = child.wait_with_output()?;
        let written = match writer.map(|w| w.join()) {
            Some(Ok(result)) => result,
            Some(Err(_)) => return Err(RenderError::Panicked("stdin writer".to_string())),
            None => Ok(()),
        };

        if !output.status.success() {
            return Err(RenderError::Exit {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        // A command that exits cleanly without reading all input is fine.
        if let Err(err) = written {
            if err.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(err.into());
            }
        }
        Ok(String::from_utf8(output.stdout)?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AsciidoctorFactory {
    command: AsciidoctorCommand,
}

impl AsciidoctorFactory {
    pub fn new(command: AsciidoctorCommand) -> Self {
        Self { command }
    }
}

impl RendererFactory for AsciidoctorFactory {
    fn create(&self) -> Result<Box<dyn BlockRender>, RenderError> {
        Ok(Box::new(Asciidoctor::new(self.command.clone())))
    }

    fn name(&self) -> &str {
        "asciidoctor"
    }
}
