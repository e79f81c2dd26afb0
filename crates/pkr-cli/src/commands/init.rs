//! Init command - create a pkr tree

use pkr_core::PkrRoot;
use std::path::Path;

use crate::error::Result;

pub fn run(path: &Path) -> Result<()> {
    let root = PkrRoot::init(path)?;
    let shown = std::fs::canonicalize(root.path()).unwrap_or_else(|_| root.path().to_path_buf());
    println!("File structure created in: {}", shown.display());
    Ok(())
}
