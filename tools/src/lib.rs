//! Standalone debug binaries for the extraction libraries.
