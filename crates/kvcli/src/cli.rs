use crate::config::{DriverKind, KvcliConfig};
use anyhow::Result;
use clap::{Parser, Subcommand};
use kvcli_storage::{
    run, DataFormat, DirDriver, Key, KvOperation, MemoryDriver, OperationOutcome, RetrieveRequest,
    SelectOptions, SelectRequest, StoreRequest,
};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

/// Parsed command line: `kvcli BDEVNAME COMMAND [OPTION]...`.
#[derive(Debug, Parser)]
#[command(name = "kvcli")]
#[command(about = "Command-line client for NVMe key-value devices", long_about = None)]
pub struct Cli {
    /// Name of the block device to use, e.g. Nvme1n1.
    pub device: String,

    /// Config file (.toml or .json).
    #[arg(short, long, env = "KVCLI_CONFIG_PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Command to run.
    #[command(subcommand)]
    pub command: Command,
}

/// kvcli commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Store the contents of FILE under KEY.
    Store {
        /// Destination key.
        #[arg(long)]
        key: Key,
        /// Input file.
        #[arg(long)]
        file: PathBuf,
        /// Append to the existing value instead of replacing it.
        #[arg(long)]
        append: bool,
    },
    /// Retrieve the contents of KEY and write them to FILE.
    Retrieve {
        /// Source key.
        #[arg(long)]
        key: Key,
        /// Output file.
        #[arg(long)]
        file: PathBuf,
        /// Resume from this value offset; the output file keeps its contents.
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
    /// List keys matching the prefix.
    List {
        /// Key prefix; all keys when omitted.
        #[arg(long, value_parser = parse_prefix, default_value = "")]
        key: Key,
    },
    /// Check whether KEY exists.
    Exists {
        /// Key to check.
        #[arg(long)]
        key: Key,
    },
    /// Delete KEY.
    Delete {
        /// Key to delete.
        #[arg(long)]
        key: Key,
    },
    /// Run an SQL query on the contents of KEY and write the result to FILE.
    Select {
        /// Key of the queried object.
        #[arg(long)]
        key: Key,
        /// Query text.
        #[arg(long)]
        sql: String,
        /// Output file.
        #[arg(long)]
        file: PathBuf,
        /// Format of the stored object: csv, json or parquet.
        #[arg(long = "input_format", visible_alias = "input-format", default_value = "csv")]
        input_format: DataFormat,
        /// Format of the result: csv, json or parquet.
        #[arg(long = "output_format", visible_alias = "output-format", default_value = "csv")]
        output_format: DataFormat,
        /// The stored CSV object starts with a header row.
        #[arg(long = "use_csv_header_for_input", visible_alias = "use-csv-header-for-input")]
        use_csv_header_for_input: bool,
        /// Write a CSV header row to the result.
        #[arg(long = "use_csv_header_for_output", visible_alias = "use-csv-header-for-output")]
        use_csv_header_for_output: bool,
    },
}

fn parse_prefix(s: &str) -> Result<Key, kvcli_storage::StorageError> {
    Key::prefix(s)
}

impl Cli {
    /// The validated operation this command line asks for.
    pub fn operation(&self) -> KvOperation {
        match &self.command {
            Command::Store { key, file, append } => KvOperation::Store(StoreRequest {
                key: key.clone(),
                source: file.clone(),
                append: *append,
            }),
            Command::Retrieve { key, file, offset } => KvOperation::Retrieve(RetrieveRequest {
                key: key.clone(),
                destination: file.clone(),
                offset: *offset,
            }),
            Command::List { key } => KvOperation::List { prefix: key.clone() },
            Command::Exists { key } => KvOperation::Exists { key: key.clone() },
            Command::Delete { key } => KvOperation::Delete { key: key.clone() },
            Command::Select {
                key,
                sql,
                file,
                input_format,
                output_format,
                use_csv_header_for_input,
                use_csv_header_for_output,
            } => KvOperation::Select(SelectRequest {
                key: key.clone(),
                query: sql.clone(),
                input: *input_format,
                output: *output_format,
                options: SelectOptions {
                    input_header: *use_csv_header_for_input,
                    output_header: *use_csv_header_for_output,
                },
                destination: file.clone(),
            }),
        }
    }

    /// Runs the command against the configured driver. `list` output goes to `out`.
    pub async fn run<W: Write>(
        &self,
        config: &KvcliConfig,
        out: &mut W,
    ) -> Result<OperationOutcome> {
        let operation = self.operation();
        info!(
            "Running {} on {} ({:?} driver)",
            operation.name(),
            self.device,
            config.driver
        );

        let outcome = match config.driver {
            DriverKind::Dir => {
                let driver = DirDriver::new(config.device_root.clone());
                run(&driver, &self.device, config.buffer_size, operation, out).await?
            }
            DriverKind::Memory => {
                let driver = MemoryDriver::new();
                run(&driver, &self.device, config.buffer_size, operation, out).await?
            }
        };
        Ok(outcome)
    }
}

/// Writes the user-facing text of an outcome, if it has any.
pub fn report<W: Write>(outcome: &OperationOutcome, out: &mut W) -> std::io::Result<()> {
    if let OperationOutcome::Exists(presence) = outcome {
        writeln!(out, "{}", presence)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvcli_storage::{KeyPresence, StorageError, MIN_BUFFER_SIZE};

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_store_args() {
        let cli = parse(&[
            "kvcli", "Nvme1n1", "store", "--key", "k1", "--file", "data.bin", "--append",
        ]);
        assert_eq!(cli.device, "Nvme1n1");
        assert_eq!(
            cli.operation(),
            KvOperation::Store(StoreRequest {
                key: Key::new("k1").unwrap(),
                source: PathBuf::from("data.bin"),
                append: true,
            })
        );
    }

    #[test]
    fn test_retrieve_offset_defaults_to_zero() {
        let cli = parse(&["kvcli", "Nvme1n1", "retrieve", "--file", "out.bin", "--key", "k1"]);
        let KvOperation::Retrieve(request) = cli.operation() else {
            panic!("expected retrieve");
        };
        assert_eq!(request.offset, 0);

        let cli = parse(&[
            "kvcli", "Nvme1n1", "retrieve", "--key", "k1", "--file", "o", "--offset", "4096",
        ]);
        let KvOperation::Retrieve(request) = cli.operation() else {
            panic!("expected retrieve");
        };
        assert_eq!(request.offset, 4096);
    }

    #[test]
    fn test_list_prefix_optional() {
        let cli = parse(&["kvcli", "Nvme1n1", "list"]);
        assert_eq!(cli.operation(), KvOperation::List { prefix: Key::prefix("").unwrap() });
        let cli = parse(&["kvcli", "Nvme1n1", "list", "--key", "sales"]);
        assert_eq!(
            cli.operation(),
            KvOperation::List {
                prefix: Key::prefix("sales").unwrap()
            }
        );
    }

    #[test]
    fn test_select_flags_and_aliases() {
        let cli = parse(&[
            "kvcli",
            "Nvme1n1",
            "select",
            "--key",
            "sales.csv",
            "--sql",
            "SELECT * FROM S3Object",
            "--file",
            "result.json",
            "--input_format",
            "csv",
            "--output-format",
            "json",
            "--use_csv_header_for_input",
            "--use-csv-header-for-output",
        ]);
        let KvOperation::Select(request) = cli.operation() else {
            panic!("expected select");
        };
        assert_eq!(request.input, DataFormat::Csv);
        assert_eq!(request.output, DataFormat::Json);
        assert_eq!(request.options.bits(), 0x03);
        assert_eq!(request.query, "SELECT * FROM S3Object");
    }

    #[test]
    fn test_invalid_input_rejected() {
        let too_long = "0123456789abcdefg";
        assert!(Cli::try_parse_from(["kvcli", "Nvme1n1", "exists", "--key", too_long]).is_err());
        assert!(Cli::try_parse_from(["kvcli", "Nvme1n1", "list", "--key", too_long]).is_err());
        assert!(Cli::try_parse_from(["kvcli", "Nvme1n1", "exists", "--key", ""]).is_err());
        assert!(Cli::try_parse_from(["kvcli", "Nvme1n1", "delete"]).is_err());
        assert!(Cli::try_parse_from(["kvcli", "Nvme1n1", "store", "--key", "k"]).is_err());
        assert!(Cli::try_parse_from([
            "kvcli",
            "Nvme1n1",
            "select",
            "--key",
            "k",
            "--sql",
            "q",
            "--file",
            "f",
            "--input_format",
            "xml",
        ])
        .is_err());
        assert!(Cli::try_parse_from(["kvcli", "Nvme1n1", "frobnicate"]).is_err());
    }

    #[test]
    fn test_config_flag() {
        let cli = parse(&[
            "kvcli", "Nvme1n1", "exists", "--key", "k", "--config", "/etc/kvcli.toml",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/kvcli.toml")));
    }

    #[tokio::test]
    async fn test_run_against_dir_driver() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("kv0")).unwrap();
        let config = KvcliConfig {
            driver: DriverKind::Dir,
            device_root: root.path().to_path_buf(),
            buffer_size: MIN_BUFFER_SIZE,
            ..KvcliConfig::default()
        };
        let input = root.path().join("in.txt");
        let output = root.path().join("out.txt");
        let payload = b"hello, key-value world".repeat(5);
        std::fs::write(&input, &payload).unwrap();
        let input_arg = input.to_str().unwrap();
        let output_arg = output.to_str().unwrap();
        let mut out = Vec::new();

        let store = parse(&["kvcli", "kv0", "store", "--key", "greeting", "--file", input_arg]);
        store.run(&config, &mut out).await.unwrap();

        let retrieve = parse(&[
            "kvcli", "kv0", "retrieve", "--key", "greeting", "--file", output_arg,
        ]);
        retrieve.run(&config, &mut out).await.unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), payload);

        let list = parse(&["kvcli", "kv0", "list"]);
        list.run(&config, &mut out).await.unwrap();
        assert_eq!(String::from_utf8(out.clone()).unwrap(), "key[0] = greeting\n");

        let exists = parse(&["kvcli", "kv0", "exists", "--key", "greeting"]);
        let outcome = exists.run(&config, &mut out).await.unwrap();
        assert_eq!(outcome, OperationOutcome::Exists(KeyPresence::Present));

        let delete = parse(&["kvcli", "kv0", "delete", "--key", "greeting"]);
        delete.run(&config, &mut out).await.unwrap();
        let outcome = exists.run(&config, &mut out).await.unwrap();
        let mut text = Vec::new();
        report(&outcome, &mut text).unwrap();
        assert_eq!(String::from_utf8(text).unwrap(), "Key does not exist.\n");
    }

    #[tokio::test]
    async fn test_list_with_undersized_buffer_fails() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("kv0")).unwrap();
        let config = KvcliConfig {
            device_root: root.path().to_path_buf(),
            buffer_size: 8,
            ..KvcliConfig::default()
        };
        let err = parse(&["kvcli", "kv0", "list"])
            .run(&config, &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::BufferTooSmall { size: 8, .. })
        ));
    }

    #[tokio::test]
    async fn test_run_missing_device() {
        let root = tempfile::tempdir().unwrap();
        let config = KvcliConfig {
            device_root: root.path().to_path_buf(),
            ..KvcliConfig::default()
        };
        let cli = parse(&["kvcli", "nope", "exists", "--key", "k"]);
        let err = cli.run(&config, &mut Vec::new()).await.unwrap_err();
        assert!(err.to_string().contains("Device not found: nope"));
    }
}
