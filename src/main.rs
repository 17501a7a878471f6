use clap::{Arg, ArgAction, Command, value_parser};
use clap_num::maybe_hex;
use exhume_body::{Body, BodySlice};
use exhume_dirtree::{LeveledCache, RecordReference, ScanConfig, ScanContext};
use log::{debug, error, info};

fn print_tree(tree: &LeveledCache) {
    for id in tree.depth_first() {
        let Some(item) = tree.get(id) else { continue };
        let marker = if item.is_directory() { "/" } else { "" };
        println!(
            "{:indent$}{}{}  {}",
            "",
            item.name.name,
            marker,
            item.size(),
            indent = item.level * 2
        );
    }
}

fn main() {
    let matches = Command::new("exhume_dirtree")
        .version("0.1.0")
        .author("ForensicXlab")
        .about("Rebuild the directory tree of an NTFS volume from its Master File Table.")
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .value_parser(value_parser!(String))
                .required(true)
                .help("The path to the body to exhume."),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_parser(value_parser!(String))
                .required(false)
                .help("The format of the file, either 'raw' or 'ewf'."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(maybe_hex::<u64>)
                .required(true)
                .help("The NTFS partition starts at address (decimal or hex)."),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_parser(maybe_hex::<u64>)
                .required(true)
                .help("The size of the NTFS partition in sectors (decimal or hex)."),
        )
        .arg(
            Arg::new("pbs")
                .long("pbs")
                .action(ArgAction::SetTrue)
                .help("Display the partition boot sector information."),
        )
        .arg(
            Arg::new("record")
                .long("record")
                .value_parser(maybe_hex::<u32>)
                .help("Display the header and attributes of one MFT record."),
        )
        .arg(
            Arg::new("tree")
                .long("tree")
                .action(ArgAction::SetTrue)
                .help("Enumerate the whole directory tree."),
        )
        .arg(
            Arg::new("size_of")
                .long("size-of")
                .value_parser(value_parser!(String))
                .help("Print the total size below a directory path, e.g. /Windows/System32."),
        )
        .arg(
            Arg::new("json")
                .short('j')
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Output certain structures (pbs, record, tree) in JSON format."),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_parser(value_parser!(String))
                .help("JSON file with scan settings."),
        )
        .arg(
            Arg::new("max_depth")
                .long("max-depth")
                .value_parser(value_parser!(usize))
                .help("Maximum directory nesting before the scan is aborted (30 to 60)."),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info")
                .help("Set the log verbosity level"),
        )
        .get_matches();

    // Initialize logger.
    let log_level_str = matches
        .get_one::<String>("log_level")
        .map(String::as_str)
        .unwrap_or("info");
    let level_filter = match log_level_str {
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "info" => log::LevelFilter::Info,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::new().filter_level(level_filter).init();

    let (Some(file_path), Some(offset), Some(size)) = (
        matches.get_one::<String>("body"),
        matches.get_one::<u64>("offset"),
        matches.get_one::<u64>("size"),
    ) else {
        error!("--body, --offset and --size are required");
        return;
    };
    let auto = String::from("auto");
    let format = matches.get_one::<String>("format").unwrap_or(&auto);
    let show_pbs = matches.get_flag("pbs");
    let show_tree = matches.get_flag("tree");
    let json_output = matches.get_flag("json");
    let record_id = matches.get_one::<u32>("record").copied();
    let size_of = matches.get_one::<String>("size_of");

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => match ScanConfig::from_json_file(path) {
            Ok(c) => c,
            Err(e) => {
                error!("Could not load configuration: {}", e);
                return;
            }
        },
        None => ScanConfig::default(),
    };
    if let Some(depth) = matches.get_one::<usize>("max_depth") {
        config.max_depth = *depth;
    }
    let config = config.validated();
    debug!("Scan configuration: {:?}", config);

    let mut body = Body::new(file_path.to_owned(), format);
    debug!("Created Body from '{}'", file_path);

    let partition_size = *size * body.get_sector_size() as u64;
    let mut slice = match BodySlice::new(&mut body, *offset, partition_size) {
        Ok(sl) => sl,
        Err(e) => {
            error!("Could not create BodySlice: {}", e);
            return;
        }
    };

    let mut ctx = match ScanContext::open(&mut slice, config) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Couldn't open NTFS: {}", e);
            return;
        }
    };

    if show_pbs {
        let pbs = &ctx.volume().pbs;
        if json_output {
            match serde_json::to_string_pretty(&pbs.to_json()) {
                Ok(s) => println!("{}", s),
                Err(e) => error!("Error serializing PBS to JSON: {}", e),
            }
        } else {
            println!("{}", pbs.to_string());
        }
    }

    if let Some(id) = record_id {
        match ctx.load_record(RecordReference::new(id, 0)) {
            Ok(record) => {
                if json_output {
                    println!("{}", record.to_json());
                } else {
                    println!("{}", record.to_string());
                }
            }
            Err(e) => error!("Could not read record {}: {}", id, e),
        }
    }

    if let Some(path) = size_of {
        match ctx.directory_size(path) {
            Ok(total) => {
                if json_output {
                    println!("{}", serde_json::json!({ "path": path, "size": total }));
                } else {
                    println!("{}  {}", path, total);
                }
            }
            Err(e) => error!("Could not size {}: {}", path, e),
        }
    }

    if show_tree {
        match ctx.enumerate() {
            Ok(tree) => {
                info!("Tree holds {} items on {} levels", tree.len(), tree.depth());
                if json_output {
                    match serde_json::to_string_pretty(&tree.to_json()) {
                        Ok(s) => println!("{}", s),
                        Err(e) => error!("Error serializing tree to JSON: {}", e),
                    }
                } else {
                    print_tree(&tree);
                }
            }
            Err(e) => {
                error!("Enumeration aborted: {}", e);
                std::process::exit(1);
            }
        }
    }
}
