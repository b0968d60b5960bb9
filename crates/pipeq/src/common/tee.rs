//! Output of a running experiment goes both to its persisted log and to the console.
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Fan-out writer: every write goes to the target and to all mirrors.
pub struct Tee {
    target: Box<dyn Write>,
    mirrors: Vec<Box<dyn Write>>,
}

impl Tee {
    pub fn new(target: Box<dyn Write>, mirrors: Vec<Box<dyn Write>>) -> Self {
        Self { target, mirrors }
    }

    /// Appends to `path`, creating the file when needed.
    pub fn append_to(path: &Path, mirrors: Vec<Box<dyn Write>>) -> crate::Result<Self> {
        let file = File::options().create(true).append(true).open(path)?;
        Ok(Self::new(Box::new(file), mirrors))
    }

    /// Writes only to the target.
    pub fn nodup(&mut self) -> TeeWriter<'_> {
        TeeWriter {
            tee: self,
            mirror: false,
        }
    }

    /// Writes to the mirrors only when `enabled`.
    pub fn verbose(&mut self, enabled: bool) -> TeeWriter<'_> {
        TeeWriter {
            tee: self,
            mirror: enabled,
        }
    }

    fn write_all_targets(&mut self, buf: &[u8], mirror: bool) -> std::io::Result<()> {
        self.target.write_all(buf)?;
        if mirror {
            for writer in self.mirrors.iter_mut() {
                writer.write_all(buf)?;
            }
        }
        Ok(())
    }

    fn flush_all_targets(&mut self, mirror: bool) -> std::io::Result<()> {
        self.target.flush()?;
        if mirror {
            for writer in self.mirrors.iter_mut() {
                writer.flush()?;
            }
        }
        Ok(())
    }
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_all_targets(buf, true)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flush_all_targets(true)
    }
}

pub struct TeeWriter<'a> {
    tee: &'a mut Tee,
    mirror: bool,
}

impl Write for TeeWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tee.write_all_targets(buf, self.mirror)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.tee.flush_all_targets(self.mirror)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crate::common::tee::Tee;
    use crate::tests::utils::SharedBuffer;

    #[test]
    fn test_fan_out() {
        let file = SharedBuffer::default();
        let console = SharedBuffer::default();
        let mut tee = Tee::new(Box::new(file.clone()), vec![Box::new(console.clone())]);

        writeln!(tee, "both").unwrap();
        writeln!(tee.nodup(), "file only").unwrap();
        writeln!(tee.verbose(false), "quiet").unwrap();
        writeln!(tee.verbose(true), "loud").unwrap();

        assert_eq!(file.text(), "both\nfile only\nquiet\nloud\n");
        assert_eq!(console.text(), "both\nloud\n");
    }

    #[test]
    fn test_append_to_file() {
        let tmp = tempfile::TempDir::with_prefix("pipeq").unwrap();
        let path = tmp.path().join("stdout_experiment.txt");
        std::fs::write(&path, "old\n").unwrap();
        {
            let mut tee = Tee::append_to(&path, vec![]).unwrap();
            writeln!(tee, "new").unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old\nnew\n");
    }
}
