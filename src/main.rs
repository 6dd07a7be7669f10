use clap::Parser as ClapParser;
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use ballvm::{Error, Outcome, VirtualMachine, VmConfig};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Program to run
    #[arg(help = "The .ball program (or .bimg image) to run")]
    program: PathBuf,

    /// Library loaded before the program
    #[arg(long, value_name = "FILE", help = "Standard library .ball file to load first")]
    stdlib: Option<PathBuf>,

    #[arg(long, value_name = "BYTES", help = "Maximum heap footprint in bytes")]
    max_heap_size: Option<usize>,

    #[arg(long, help = "Disable garbage collection")]
    no_gc: bool,

    #[arg(long, help = "Never compile hot functions to native code")]
    no_jit: bool,

    #[arg(long, value_name = "N", help = "Calls before a function is compiled")]
    jit_threshold: Option<u32>,

    /// Print the loaded program instead of running it
    #[arg(long, help = "Disassemble instead of executing")]
    disasm: bool,

    #[arg(long, value_name = "FILE", help = "Write a pre-linked image after loading")]
    emit_image: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::Count, help = "More logging (-v info, -vv debug, -vvv trace)")]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(Outcome::Returned) => {}
        Ok(Outcome::Halted(code)) => process::exit(code),
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn config(cli: &Cli) -> VmConfig {
    let defaults = VmConfig::default();
    VmConfig {
        max_heap_bytes: cli.max_heap_size.unwrap_or(defaults.max_heap_bytes),
        gc_enabled: !cli.no_gc,
        jit_enabled: !cli.no_jit,
        jit_threshold: cli.jit_threshold.unwrap_or(defaults.jit_threshold),
        max_call_depth: defaults.max_call_depth,
    }
}

fn run(cli: &Cli) -> Result<Outcome, Error> {
    let mut vm = VirtualMachine::new(config(cli));

    if extension(&cli.program) == Some("bimg") {
        if cli.stdlib.is_some() {
            return Err(Error::Usage(
                "--stdlib cannot be combined with an image; images already contain their library"
                    .to_string(),
            ));
        }
        vm.load_image_file(&cli.program)?;
    } else {
        ensure_extension(&cli.program)?;
        if let Some(stdlib) = &cli.stdlib {
            ensure_extension(stdlib)?;
            vm.load_stdlib(stdlib)?;
        }
        vm.load_program(&cli.program)?;
    }

    if let Some(path) = &cli.emit_image {
        let image = vm.save_image()?;
        fs::write(path, &image)?;
        info!("wrote image {} ({} bytes)", path.display(), image.len());
    }

    if cli.disasm {
        print!("{}", vm.disassemble());
        print!("{}", vm.statistics());
        return Ok(Outcome::Returned);
    }

    vm.run()
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|e| e.to_str())
}

fn ensure_extension(path: &Path) -> Result<(), Error> {
    if extension(path) != Some("ball") {
        return Err(Error::Usage(format!(
            "expected a .ball or .bimg file, got {}",
            path.display()
        )));
    }
    Ok(())
}
