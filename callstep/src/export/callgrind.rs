//! Callgrind profile writer
//!
//! Emits the subset of the callgrind format used by `callgrind_annotate` and
//! KCachegrind: one `ob=/fl=/fn=` block per function with `instr line` position
//! lines, followed by its `cfi=/cfn=/cob=/calls=` call edges.
//!
//! Format reference: <https://valgrind.org/docs/manual/cl-format.html>

use std::io::{self, BufWriter, Write};
use std::path::Path;

use log::{debug, info};
use tempfile::Builder;

use crate::domain::SessionError;
use crate::model::{CostModel, Function, ObjectFile};

/// Creator name written into the header by default
pub const DEFAULT_CREATOR: &str = "callstep";

/// Serializes a `CostModel` into callgrind text
#[derive(Debug, Clone)]
pub struct ProfileWriter {
    creator: String,
}

impl Default for ProfileWriter {
    fn default() -> Self {
        Self::new(DEFAULT_CREATOR)
    }
}

impl ProfileWriter {
    /// Create a writer that reports `creator` in the profile header
    pub fn new(creator: impl Into<String>) -> Self {
        Self { creator: creator.into() }
    }

    /// Write the profile to any writer (file, stdout, buffer, etc.)
    ///
    /// The writer is flushed before returning.
    ///
    /// # Errors
    /// Returns any I/O error raised by `out`
    pub fn write_to<W: Write>(&self, model: &CostModel, mut out: W) -> io::Result<()> {
        self.write_header(&mut out)?;

        for object in model.objects() {
            for function in object.functions() {
                write_function(&mut out, object, function)?;
            }
        }

        out.flush()
    }

    /// Write the profile to `path`.
    ///
    /// The profile is written to a temporary file in the destination directory
    /// and renamed over `path` once complete, so `path` never holds a partial
    /// profile.
    ///
    /// # Errors
    /// Returns `SessionError::OutputWrite` if the file cannot be created, written or renamed
    pub fn write_file(&self, model: &CostModel, path: &Path) -> Result<(), SessionError> {
        let output_error = |source: io::Error| SessionError::OutputWrite { path: path.to_path_buf(), source };

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut tmp = temp_file_builder().tempfile_in(dir).map_err(output_error)?;
        debug!("Writing profile to temporary file {}", tmp.path().display());

        self.write_to(model, BufWriter::new(tmp.as_file_mut())).map_err(output_error)?;
        tmp.as_file().sync_all().map_err(output_error)?;

        tmp.persist(path).map_err(|e| output_error(e.error))?;

        info!(
            "Wrote {} functions, {} call edges to {}",
            model.function_count(),
            model.call_edge_count(),
            path.display()
        );
        Ok(())
    }

    fn write_header<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "# callgrind format")?;
        writeln!(out, "version: 1")?;
        writeln!(out, "creator: {}", self.creator)?;
        writeln!(out, "positions: instr line")?;
        writeln!(out, "events: Instructions")?;
        writeln!(out)
    }
}

fn write_function<W: Write>(out: &mut W, object: &ObjectFile, function: &Function) -> io::Result<()> {
    writeln!(out, "ob={}", object.object_file())?;
    writeln!(out, "fl={}", object.source_file())?;
    writeln!(out, "fn={}", function.name())?;
    for (position, count) in function.positions() {
        writeln!(out, "{} {} {}", position.address, position.line, count)?;
    }
    writeln!(out)?;

    for (callee, edge) in function.calls() {
        writeln!(out, "cfi={}", edge.callee_source_file())?;
        writeln!(out, "cfn={}", callee.function)?;
        writeln!(out, "cob={}", callee.object_file)?;
        writeln!(out, "calls=1 {}", edge.destination())?;
        writeln!(out, "{} {} {}", edge.source_position(), edge.source_line(), edge.inclusive_cost())?;
    }
    writeln!(out)
}

/// Temporary files default to 0600. Profiles get the mode `File::create`
/// would give them: 0666 less the umask.
fn temp_file_builder() -> Builder<'static, 'static> {
    let mut builder = Builder::new();
    builder.prefix(".callgrind-");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o666));
    }
    builder
}
