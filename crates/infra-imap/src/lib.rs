mod parser;
mod transport;

pub use parser::MimeParser;
pub use transport::{ImapConfig, ImapConnection, ImapTransport};
