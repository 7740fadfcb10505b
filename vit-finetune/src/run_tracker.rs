use log::info;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

///
/// Local experiment tracker. A run lives in
/// `{root}/{project}/{name}` (suffixed `-1`, `-2`, ... if taken):
///
/// - `config.json`: the run configuration
/// - `metrics.jsonl`: one object per `log` call, tagged with `_step`
/// - `summary.json`: the last value of every key, written by `finish`
///
pub struct RunTracker {
    run_dir: PathBuf,
    metrics: BufWriter<File>,
    summary: Map<String, Value>,
    step: usize,
}

impl RunTracker {
    pub fn init<C: Serialize>(
        root: &Path,
        project: &str,
        name: &str,
        config: &C,
    ) -> anyhow::Result<Self> {
        let project_dir = root.join(project);
        std::fs::create_dir_all(&project_dir)?;

        let mut run_dir = project_dir.join(name);
        let mut suffix = 0;
        while run_dir.exists() {
            suffix += 1;
            run_dir = project_dir.join(format!("{}-{}", name, suffix));
        }
        std::fs::create_dir_all(&run_dir)?;

        write_json(&run_dir.join("config.json"), config)?;

        let metrics = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join("metrics.jsonl"))?;

        info!("tracking run in {}", run_dir.display());

        Ok(Self {
            run_dir,
            metrics: BufWriter::new(metrics),
            summary: Map::new(),
            step: 0,
        })
    }

    /// Append one record of metrics; `metrics` must be a JSON object
    pub fn log(&mut self, metrics: Value) -> anyhow::Result<()> {
        let Value::Object(mut record) = metrics else {
            return Err(anyhow::anyhow!("metrics must be a JSON object"));
        };

        for (k, v) in record.iter() {
            self.summary.insert(k.clone(), v.clone());
        }
        record.insert("_step".to_string(), Value::from(self.step));
        self.step += 1;

        serde_json::to_writer(&mut self.metrics, &record)?;
        self.metrics.write_all(b"\n")?;
        self.metrics.flush()?;
        Ok(())
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn finish(mut self) -> anyhow::Result<()> {
        self.metrics.flush()?;
        write_json(&self.run_dir.join("summary.json"), &self.summary)?;
        info!("run summary written to {}", self.run_dir.display());
        Ok(())
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}
