use crate::domain::transaction::TransferRequest;
use crate::error::{LedgerError, Result};
use std::io::Read;

/// Reads transfer requests from a CSV source with a
/// `source, destination, value` header.
///
/// This reader wraps `csv::Reader` and provides an iterator over
/// `Result<TransferRequest>`, so a malformed row only fails that row. Values are
/// parsed as decimals; whether they are positive is checked on submit.
pub struct TransferReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> TransferReader<R> {
    /// Creates a new `TransferReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Returns an iterator that lazily reads and deserializes requests.
    pub fn requests(self) -> impl Iterator<Item = Result<TransferRequest>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(LedgerError::from))
    }
}
