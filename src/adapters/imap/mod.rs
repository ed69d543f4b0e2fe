pub mod connection;
pub mod envelopes;
pub mod fetch;

pub use connection::{connect, ImapConnection};
pub use fetch::{fetch_new, mark_seen, FetchedEmail};
