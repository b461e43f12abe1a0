use anyhow::{Context, Result};
use clap::Parser;
use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use varg::api::{CollectCloser, Input, IterateCloser, PartCollector};
use varg::codec::{Null, RawStr, RawVInt, Sv};
use varg::{DirOutput, FileSorter, FsPath, MapFlow, Mapper, MrJob, Reducer, Sorter, SvIter};

#[derive(Parser, Debug)]
struct Args {
    /// Directory of plain-text input files
    #[arg(long)]
    input: String,
    /// Output directory (KV files, one per partition)
    #[arg(long)]
    output: String,
    /// Spill directory for the file sorter
    #[arg(long, default_value = ".varg_tmp")]
    tmp: String,
    /// Sort in memory instead of spilling to disk
    #[arg(long)]
    mem: bool,
}

/// A directory of plain-text files as a job input: one partition per
/// file, one record per line (carried in the key slot).
struct TextDirInput {
    dir: PathBuf,
}

impl TextDirInput {
    fn files(&self) -> varg::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.metadata()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}

impl Input for TextDirInput {
    fn part_count(&self) -> varg::Result<usize> {
        Ok(self.files()?.len())
    }

    fn iterator(&self, part: usize) -> varg::Result<Box<dyn IterateCloser>> {
        let files = self.files()?;
        let path = files.get(part).ok_or_else(|| {
            varg::Error::Config(format!("partition {part} out of range ({} files)", files.len()))
        })?;
        let file = File::open(path)?;
        Ok(Box::new(TextLinesIter { lines: BufReader::new(file).lines() }))
    }
}

struct TextLinesIter {
    lines: std::io::Lines<BufReader<File>>,
}

impl IterateCloser for TextLinesIter {
    fn next(&mut self, key: &mut dyn Sv, _val: &mut dyn Sv) -> varg::Result<bool> {
        match self.lines.next() {
            Some(line) => {
                key.downcast_mut::<RawStr>().expect("RawStr key slot").0 = line?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn close(&mut self) -> varg::Result<()> {
        Ok(())
    }
}

struct WordcountMapper {
    word_re: Regex,
    partitions: usize,
}

impl Mapper for WordcountMapper {
    fn new_key(&self) -> Box<dyn Sv> {
        Box::new(RawStr::default())
    }

    fn new_val(&self) -> Box<dyn Sv> {
        Box::new(Null)
    }

    fn map(&mut self, key: &dyn Sv, _val: &dyn Sv, c: &dyn PartCollector) -> varg::Result<MapFlow> {
        let line = &key.downcast_ref::<RawStr>().expect("line key").0;
        for cap in self.word_re.find_iter(line) {
            let word = cap.as_str().to_lowercase();
            let part = word.as_bytes()[0] as usize % self.partitions;
            c.collect_to(part, &RawStr(word), &RawVInt(1))?;
        }
        Ok(MapFlow::Continue)
    }
}

struct WordcountReducer;

impl Reducer for WordcountReducer {
    fn new_key(&self) -> Box<dyn Sv> {
        Box::new(RawStr::default())
    }

    fn new_val(&self) -> Box<dyn Sv> {
        Box::new(RawVInt(0))
    }

    fn reduce(
        &mut self,
        key: &dyn Sv,
        vals: &mut dyn SvIter,
        c: &mut [Box<dyn CollectCloser>],
    ) -> varg::Result<()> {
        let mut count = 0u64;
        while let Some(val) = vals.next()? {
            count += val.downcast_ref::<RawVInt>().expect("count val").0;
        }
        c[0].collect(key, &RawVInt(count))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let word_re = Regex::new(r"[A-Za-z0-9_']+").context("word regex")?;
    let sorter: Box<dyn Sorter> = if args.mem {
        Box::new(varg::MemSorter::new())
    } else {
        Box::new(FileSorter::new(FsPath::local(&args.tmp)))
    };

    let out = DirOutput(FsPath::local(&args.output));
    out.clean().context("clean output dir")?;

    let job = MrJob {
        source: vec![Box::new(TextDirInput { dir: PathBuf::from(&args.input) })],
        new_mapper: Some(Box::new(move |_src, _part| {
            Box::new(WordcountMapper { word_re: word_re.clone(), partitions: 16 })
        })),
        new_reducer: Some(Box::new(|_part| Box::new(WordcountReducer))),
        sorter: Some(sorter),
        dest: vec![Box::new(out)],
    };
    job.run().context("word count job")?;
    Ok(())
}
