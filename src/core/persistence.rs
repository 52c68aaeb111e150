//! Chain rule files
//!
//! iptables keeps nothing across a reboot or a broad flush, so every custom
//! chain is mirrored to a plain text file: one `-A CHAIN ...` line per rule,
//! exactly as `iptables -S CHAIN` prints it. Files are rewritten after every
//! mutation, including one that failed halfway, and replayed at startup or
//! whenever a managed chain turns out to be missing.
//!
//! Two saves racing on the same chain resolve last-writer-wins; the file is
//! replaced atomically so a reader never sees a torn file.

use crate::core::chain::{ChainKind, IptablesCmd, Table};
use crate::core::error::{Error, Result};
use crate::core::parsers;
use crate::runner::CommandRunner;
use crate::utils;
use crate::validators;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Directory of chain rule files
#[derive(Debug, Clone)]
pub struct RuleStore {
    dir: PathBuf,
}

impl RuleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Snapshots a managed chain to its file.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the chain cannot be dumped or the file cannot be written.
    pub async fn save<R: CommandRunner>(
        &self,
        cmd: &IptablesCmd<R>,
        kind: ChainKind,
    ) -> Result<()> {
        self.save_chain(cmd, kind.table(), kind.chain_name(), kind.file_name())
            .await
    }

    /// Dumps `chain` and overwrites `file_name` with its append lines.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the chain cannot be dumped or the file cannot be written.
    pub async fn save_chain<R: CommandRunner>(
        &self,
        cmd: &IptablesCmd<R>,
        table: Table,
        chain: &str,
        file_name: &str,
    ) -> Result<()> {
        let dump = cmd.dump(table, Some(chain)).await?;
        let lines = parsers::append_lines(&dump, chain);

        let mut contents = lines.join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }

        let path = self.dir.join(file_name);
        utils::write_atomic(&path, contents)
            .await
            .map_err(|e| Error::Persistence {
                path: path.clone(),
                message: e.to_string(),
            })?;
        debug!("Saved {} rules of {chain} to {}", lines.len(), path.display());
        Ok(())
    }

    /// Replays a managed chain from its file. Returns the number of rules restored.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file is unreadable or the chain cannot be created
    /// or flushed. Individual rule lines that fail are logged and skipped.
    pub async fn load<R: CommandRunner>(
        &self,
        cmd: &IptablesCmd<R>,
        kind: ChainKind,
    ) -> Result<usize> {
        self.load_chain(cmd, kind.table(), kind.chain_name(), kind.file_name())
            .await
    }

    /// Clears `chain` and re-appends every line saved in `file_name`.
    ///
    /// A missing file means a fresh install and leaves the chain untouched.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file is unreadable or the chain cannot be created
    /// or flushed.
    pub async fn load_chain<R: CommandRunner>(
        &self,
        cmd: &IptablesCmd<R>,
        table: Table,
        chain: &str,
        file_name: &str,
    ) -> Result<usize> {
        let path = self.dir.join(file_name);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No saved rules for {chain} at {}", path.display());
                return Ok(0);
            }
            Err(e) => {
                return Err(Error::Persistence {
                    path,
                    message: e.to_string(),
                });
            }
        };

        cmd.ensure_chain(table, chain).await?;
        cmd.flush_chain(table, chain).await?;

        let mut restored = 0;
        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if !parsers::is_append_to(line, chain) {
                warn!("Skipping foreign line in {}: {line}", path.display());
                continue;
            }
            if let Err(e) = validators::check_shell_safe(line) {
                warn!("Skipping unsafe line in {}: {e}", path.display());
                continue;
            }
            match cmd.run(table, line).await {
                Ok(_) => restored += 1,
                Err(e) => error!("Failed to restore rule into {chain}: {e}"),
            }
        }
        info!("Restored {restored} rules into {chain}");
        Ok(restored)
    }

    /// Loads every managed chain. Failures are logged per chain.
    pub async fn load_all<R: CommandRunner>(&self, cmd: &IptablesCmd<R>) -> usize {
        let mut total = 0;
        for kind in ChainKind::ALL {
            match self.load(cmd, kind).await {
                Ok(n) => total += n,
                Err(e) => error!("Failed to restore chain {}: {e}", kind.chain_name()),
            }
        }
        total
    }
}
