pub mod transfer_reader;
