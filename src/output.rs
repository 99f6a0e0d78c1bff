use std::path::PathBuf;

use csv_core::WriteResult;

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short='f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize the record to JSON")]
    SerializeJson(#[source] serde_json::Error),
    #[error("CSV headers must be written before any of the rows")]
    LateCsvHeaders,
}

impl Args {
    pub fn to_output(self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<_>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        Ok(Output::new(self, io))
    }
}

pub struct Output {
    args: Args,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Csv { written_records: bool },
    Table { comfy: comfy_table::Table },
    Jsonl,
}

impl Output {
    fn new(args: Args, io: Box<dyn std::io::Write>) -> Self {
        let formatter = match &args.format {
            Format::Table => {
                let mut comfy = comfy_table::Table::new();
                comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table { comfy }
            }
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv { written_records: false },
        };
        Output { args, io, formatter }
    }

    pub fn headers(&mut self, hdrs: &[&'static str]) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records: true } => return Err(Error::LateCsvHeaders),
            Formatter::Csv { written_records } => {
                *written_records = true;
                self.write_csv_row(hdrs)?;
            }
            Formatter::Table { comfy } => {
                comfy.set_header(hdrs.to_vec());
            }
            Formatter::Jsonl => {}
        }
        Ok(())
    }

    fn write_csv_row<V: AsRef<str>>(&mut self, values: &[V]) -> Result<(), Error> {
        let mut writer = csv_core::Writer::new();
        let mut line = Vec::new();
        for (idx, value) in values.iter().enumerate() {
            if idx != 0 {
                csv_step(&mut line, |out| {
                    let (result, written) = writer.delimiter(out);
                    (result, 0, written)
                });
            }
            let mut input = value.as_ref().as_bytes();
            loop {
                let (result, read) = csv_step(&mut line, |out| writer.field(input, out));
                input = &input[read..];
                if result == WriteResult::InputEmpty {
                    break;
                }
            }
        }
        csv_step(&mut line, |out| {
            let (result, written) = writer.terminator(out);
            (result, 0, written)
        });
        self.io.write_all(&line).map_err(|e| self.write_error(e))
    }

    pub fn row<R: serde::Serialize>(
        &mut self,
        table_row: impl FnOnce() -> Vec<String>,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                *written_records = true;
                let values = table_row();
                self.write_csv_row(&values)?;
            }
            Formatter::Table { comfy } => {
                comfy.add_row(table_row());
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &serde_record())
                    .map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?
            }
        }
        Ok(())
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.args.output {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.into()),
        }
    }

    pub fn commit(mut self) -> Result<(), Error> {
        match &self.formatter {
            Formatter::Csv { written_records: _ } => {}
            Formatter::Table { comfy } => {
                self.io.write_fmt(format_args!("{comfy}\n")).map_err(|e| self.write_error(e))?;
            }
            Formatter::Jsonl => {}
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }
}

/// Run one `csv_core` writer step, appending its output to `line`. Returns the step's result
/// and how much input it consumed.
fn csv_step(
    line: &mut Vec<u8>,
    mut step: impl FnMut(&mut [u8]) -> (WriteResult, usize, usize),
) -> (WriteResult, usize) {
    let mut buffer = [0; 256];
    let (result, read, written) = step(&mut buffer);
    line.extend_from_slice(&buffer[..written]);
    (result, read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn output(format: Format) -> (Output, Sink) {
        let sink = Sink::default();
        let args = Args { output: None, format };
        (Output::new(args, Box::new(sink.clone())), sink)
    }

    fn text(sink: &Sink) -> String {
        String::from_utf8(sink.0.lock().unwrap().clone()).unwrap()
    }

    #[test]
    fn csv_quotes_fields() {
        let (mut out, sink) = output(Format::Csv);
        out.headers(&["key", "value"]).unwrap();
        out.row(|| vec!["a,b".into(), "say \"hi\"".into()], || ()).unwrap();
        let long = "x".repeat(600);
        out.row(|| vec![long.clone(), String::new()], || ()).unwrap();
        assert!(matches!(out.headers(&["late"]), Err(Error::LateCsvHeaders)));
        out.commit().unwrap();
        assert_eq!(text(&sink), format!("key,value\n\"a,b\",\"say \"\"hi\"\"\"\n{long},\n"));
    }

    #[test]
    fn jsonl_writes_records() {
        let (mut out, sink) = output(Format::Jsonl);
        out.headers(&["ignored"]).unwrap();
        out.row(Vec::new, || serde_json::json!({ "key": "eco_mode", "state": "ON" })).unwrap();
        out.commit().unwrap();
        assert_eq!(text(&sink), "{\"key\":\"eco_mode\",\"state\":\"ON\"}\n");
    }

    #[test]
    fn table_has_headers_and_rows() {
        let (mut out, sink) = output(Format::Table);
        out.headers(&["Key", "State"]).unwrap();
        out.row(|| vec!["eco_mode".into(), "on".into()], || ()).unwrap();
        out.commit().unwrap();
        let text = text(&sink);
        assert!(text.contains("Key") && text.contains("eco_mode"));
    }
}
