//! Directories of KV files as job inputs and outputs.
//!
//! A directory's immediate children, in sorted name order, are the
//! partitions: `part_count` is the child count and `iterator(i)` opens
//! the i-th child as a KV reader. On the output side, `collector(i)`
//! ensures the directory exists and creates `part-{i:05}`.

use crate::api::{CollectCloser, Input, IterateCloser, Output};
use crate::error::{Error, Result};
use crate::fs::FsPath;
use crate::kvfile::{KvReader, KvWriter};

/// A folder of KV files as a job [`Input`].
#[derive(Debug, Clone)]
pub struct DirInput(pub FsPath);

impl Input for DirInput {
    fn part_count(&self) -> Result<usize> {
        Ok(self.0.read_dir()?.len())
    }

    fn iterator(&self, part: usize) -> Result<Box<dyn IterateCloser>> {
        let infos = self.0.read_dir()?;
        let info = infos.get(part).ok_or_else(|| {
            Error::Config(format!(
                "input partition {part} out of range ({} children in {})",
                infos.len(),
                self.0.path.display()
            ))
        })?;
        Ok(Box::new(KvReader::open(&self.0.join(&info.name))?))
    }
}

/// A folder of KV files as a job [`Output`].
#[derive(Debug, Clone)]
pub struct DirOutput(pub FsPath);

impl DirOutput {
    /// Removes the folder and everything in it.
    pub fn clean(&self) -> Result<()> {
        self.0.remove()
    }
}

impl Output for DirOutput {
    fn collector(&self, part: usize) -> Result<Box<dyn CollectCloser>> {
        self.0.mkdir()?;
        let fp = self.0.join(format!("part-{part:05}"));
        Ok(Box::new(KvWriter::create(&fp)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Collector;
    use crate::codec::{Str, VInt};
    use tempfile::tempdir;

    #[test]
    fn output_then_input_round_trip() {
        let dir = tempdir().unwrap();
        let root = FsPath::local(dir.path().join("out"));
        let out = DirOutput(root.clone());

        for part in 0..3usize {
            let mut c = out.collector(part).unwrap();
            c.collect(&Str::new(format!("key-{part}")), &VInt(part as u64)).unwrap();
            c.close().unwrap();
        }

        let input = DirInput(root);
        assert_eq!(input.part_count().unwrap(), 3);

        let mut key = Str::default();
        let mut val = VInt(0);
        for part in 0..3usize {
            let mut it = input.iterator(part).unwrap();
            assert!(it.next(&mut key, &mut val).unwrap());
            assert_eq!(key.0, format!("key-{part}"));
            assert_eq!(val.0, part as u64);
            assert!(!it.next(&mut key, &mut val).unwrap());
            it.close().unwrap();
        }

        assert!(matches!(input.iterator(3), Err(Error::Config(_))));
    }

    #[test]
    fn clean_removes_everything() {
        let dir = tempdir().unwrap();
        let root = FsPath::local(dir.path().join("out"));
        let out = DirOutput(root.clone());
        out.collector(0).unwrap().close().unwrap();
        assert_eq!(root.read_dir().unwrap().len(), 1);
        out.clean().unwrap();
        assert!(root.read_dir().is_err());
    }
}
