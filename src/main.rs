use std::cmp::Ordering;
use std::error::Error;
use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use ext_file_sort::{Codec, ExternalSorterBuilder, FixedSizeCodec, LinesCodec, SortStats};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let order: Order = arg_parser.value_of_t_or_exit("sort");
    let format: Format = arg_parser.value_of_t_or_exit("format");
    let settings = Settings {
        input: arg_parser.value_of("input").expect("value is required").into(),
        output: arg_parser.value_of("output").expect("value is required").into(),
        tmp_dir: arg_parser.value_of("tmp_dir").map(path::PathBuf::from),
        threads: arg_parser
            .is_present("threads")
            .then(|| arg_parser.value_of_t_or_exit("threads")),
        chunk_items: arg_parser.value_of_t_or_exit("chunk_items"),
        merge_files: arg_parser.value_of_t_or_exit("merge_files"),
        rw_buf_size: arg_parser.value_of("rw_buf_size").map(|buf_size| {
            buf_size.parse::<ByteSize>().expect("value is pre-validated").as_u64() as usize
        }),
    };

    let result = match format {
        Format::Lines => sort::<String, _>(&settings, LinesCodec, order),
        Format::Fixed => {
            let record_size: usize = arg_parser.value_of_t_or_exit("record_size");
            sort::<Vec<u8>, _>(&settings, FixedSizeCodec::new(record_size), order)
        }
    };

    match result {
        Ok(stats) => log::info!(
            "{} records sorted ({} chunks, {} merge rounds)",
            stats.records,
            stats.chunks,
            stats.merge_rounds
        ),
        Err(err) => {
            log::error!("data sorting error: {}", err);
            process::exit(1);
        }
    }
}

struct Settings {
    input: path::PathBuf,
    output: path::PathBuf,
    tmp_dir: Option<path::PathBuf>,
    threads: Option<usize>,
    chunk_items: usize,
    merge_files: usize,
    rw_buf_size: Option<usize>,
}

fn sort<T, C>(settings: &Settings, codec: C, order: Order) -> Result<SortStats, Box<dyn Error>>
where
    T: Ord + Send,
    C: Codec<T>,
    C::SerializationError: 'static,
    C::DeserializationError: 'static,
{
    let mut sorter_builder = ExternalSorterBuilder::<T, C>::from_codec(codec)
        .with_max_items_per_chunk(settings.chunk_items)
        .with_max_files_per_merge(settings.merge_files)
        .with_progress_log();

    if let Some(threads) = settings.threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }

    if let Some(tmp_dir) = &settings.tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(tmp_dir);
    }

    if let Some(rw_buf_size) = settings.rw_buf_size {
        sorter_builder = sorter_builder.with_rw_buf_size(rw_buf_size);
    }

    let sorter = sorter_builder.build()?;

    let compare: fn(&T, &T) -> Ordering = match order {
        Order::Asc => |a, b| a.cmp(b),
        Order::Desc => |a, b| a.cmp(b).reverse(),
    };

    return Ok(sorter.sort_file_by(&settings.input, &settings.output, compare)?);
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Order {
    Asc,
    Desc,
}

impl Order {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Order::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Order {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Order as clap::ArgEnum>::from_str(s, false)
    }
}

/// Input/output record format.
#[derive(Copy, Clone, clap::ArgEnum)]
enum Format {
    /// UTF-8 text, one record per line.
    Lines,
    /// Binary records of `record_size` bytes compared bytewise.
    Fixed,
}

impl Format {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Format::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Format as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("ext-file-sort")
        .about("external merge sorter")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("format")
                .short('f')
                .long("format")
                .help("record format")
                .takes_value(true)
                .default_value("lines")
                .possible_values(Format::possible_values()),
        )
        .arg(
            clap::Arg::new("record_size")
                .short('r')
                .long("record-size")
                .help("record size in bytes of the fixed format")
                .takes_value(true)
                .required_if_eq("format", "fixed")
                .validator(|v| match v.parse::<usize>() {
                    Ok(0) => Err("Record size must be positive".to_string()),
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Record size format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("sort")
                .short('s')
                .long("sort")
                .help("sorting order")
                .takes_value(true)
                .default_value("asc")
                .possible_values(Order::possible_values()),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel chunk sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("chunk_items")
                .short('c')
                .long("chunk-items")
                .help("maximum number of records sorted in memory at once")
                .takes_value(true)
                .default_value("100000"),
        )
        .arg(
            clap::Arg::new("merge_files")
                .short('m')
                .long("merge-files")
                .help("maximum number of files merged at once")
                .takes_value(true)
                .default_value("100"),
        )
        .arg(
            clap::Arg::new("rw_buf_size")
                .short('b')
                .long("rw-buf-size")
                .help("temporary files read/write buffer size")
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Buffer size format incorrect: {}", err)),
                }),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
