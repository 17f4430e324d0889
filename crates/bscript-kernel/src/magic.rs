//! `//!` cell magics, interpreted by the kernel before the backend sees the code.

pub const MAGIC_PREFIX: &str = "//!";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Magic {
    /// `//! session`: print the session id the cell runs in.
    Session,
    /// `//! attach <id>`: run this session's cells in `<id>` from now on.
    Attach(String),
    /// Anything else; ignored.
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preprocessed {
    /// The cell with every magic line removed.
    pub code: String,
    pub magics: Vec<Magic>,
}

impl Preprocessed {
    pub fn is_empty(&self) -> bool {
        self.code.trim().is_empty()
    }
}

pub fn extract(cell: &str) -> Preprocessed {
    let mut code = String::with_capacity(cell.len());
    let mut magics = Vec::new();
    for line in cell.lines() {
        match line.strip_prefix(MAGIC_PREFIX) {
            Some(command) => magics.push(parse(command)),
            None => {
                code.push_str(line);
                code.push('\n');
            }
        }
    }
    Preprocessed { code, magics }
}

fn parse(command: &str) -> Magic {
    let mut words = command.split_whitespace();
    match (words.next(), words.next()) {
        (Some("session"), _) => Magic::Session,
        (Some("attach"), Some(target)) => Magic::Attach(target.to_string()),
        _ => Magic::Unknown(command.trim().to_string()),
    }
}
