use anyhow::{Context, Result};
use clap::{AppSettings, ArgEnum, Args, Parser, Subcommand};
use kvsp::config::{DEFAULT_BOUNDARY, DEFAULT_RAM_SIZE, DEFAULT_ROM_SIZE};
use kvsp::packet::{PlainRequest, Request};
use kvsp::result::UNKNOWN_CYCLES;
use kvsp::tools::{EnvResolver, SystemInvoker, Tool, Toolchain, ALL_BITS};
use kvsp::{ImageConfig, Packet, PacketFormat, PlainResult, RamPlanes, RunConfig};
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::info;
use tracing_subscriber::EnvFilter;

type Tools = Toolchain<EnvResolver, SystemInvoker>;

#[derive(Parser, Debug)]
#[clap(name = "kvsp", version, about = "Virtual Secure Platform driver")]
struct Opts {
    /// Echo resolved tools and every spawned command
    #[clap(short, long, global = true, env = "KVSP_VERBOSE")]
    verbose: bool,

    #[clap(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Compile C sources for the CAHP target
    #[clap(setting = AppSettings::TrailingVarArg)]
    Cc {
        #[clap(allow_hyphen_values = true, parse(from_os_str))]
        args: Vec<OsString>,
    },
    /// Run the cycle-accurate plaintext simulator
    #[clap(setting = AppSettings::TrailingVarArg)]
    Debug {
        #[clap(allow_hyphen_values = true, parse(from_os_str))]
        args: Vec<OsString>,
    },
    /// Generate a secret key
    Genkey {
        /// Output key file
        #[clap(short, parse(from_os_str))]
        output: PathBuf,
    },
    /// Encrypt an executable into a request packet
    Enc {
        /// Secret key file
        #[clap(short, parse(from_os_str))]
        key: PathBuf,
        /// Input executable
        #[clap(short, parse(from_os_str))]
        input: PathBuf,
        /// Output request packet
        #[clap(short, parse(from_os_str))]
        output: PathBuf,
        #[clap(flatten)]
        image: ImageArgs,
        /// Command line handed to the program
        #[clap(last = true)]
        args: Vec<String>,
    },
    /// Write an unencrypted request packet
    PlainEnc {
        #[clap(short, parse(from_os_str))]
        input: PathBuf,
        #[clap(short, parse(from_os_str))]
        output: PathBuf,
        #[clap(flatten)]
        image: ImageArgs,
        #[clap(last = true)]
        args: Vec<String>,
    },
    /// Evaluate an encrypted request packet
    Run {
        /// Number of clock cycles to run
        #[clap(short, parse(try_from_str = parse_nonzero))]
        cycles: u64,
        #[clap(short, parse(from_os_str))]
        input: PathBuf,
        #[clap(short, parse(from_os_str))]
        output: PathBuf,
        #[clap(short, long)]
        threads: Option<usize>,
    },
    /// Decrypt a response packet
    Dec {
        #[clap(short, parse(from_os_str))]
        key: PathBuf,
        #[clap(short, parse(from_os_str))]
        input: PathBuf,
        #[clap(long)]
        json: bool,
        #[clap(flatten)]
        image: ImageArgs,
    },
    /// Evaluate an executable in plaintext
    Emu {
        #[clap(short, parse(from_os_str))]
        input: PathBuf,
        #[clap(long)]
        json: bool,
        #[clap(short, long)]
        threads: Option<usize>,
        #[clap(flatten)]
        image: ImageArgs,
        #[clap(last = true)]
        args: Vec<String>,
    },
    /// Print a plaintext result document
    Show {
        #[clap(short, parse(from_os_str))]
        input: PathBuf,
        #[clap(long)]
        json: bool,
        #[clap(flatten)]
        image: ImageArgs,
    },
}

#[derive(ArgEnum, Debug, Clone, Copy)]
enum Planes {
    Single,
    Dual,
}

#[derive(Args, Debug, Clone)]
struct ImageArgs {
    /// Instruction memory size in bytes
    #[clap(long, default_value_t = DEFAULT_ROM_SIZE)]
    rom_size: usize,
    /// Data memory size in bytes
    #[clap(long, default_value_t = DEFAULT_RAM_SIZE)]
    ram_size: usize,
    /// First virtual address of data memory
    #[clap(long, default_value_t = DEFAULT_BOUNDARY, parse(try_from_str = parse_int))]
    boundary: u64,
    /// How RAM is laid out in packets
    #[clap(long, arg_enum, default_value = "single")]
    ram_planes: Planes,
}

impl From<&ImageArgs> for ImageConfig {
    fn from(args: &ImageArgs) -> Self {
        ImageConfig {
            rom_size: args.rom_size,
            ram_size: args.ram_size,
            boundary: args.boundary,
            ram_planes: match args.ram_planes {
                Planes::Single => RamPlanes::Single,
                Planes::Dual => RamPlanes::Dual,
            },
        }
    }
}

fn parse_int(s: &str) -> Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn parse_nonzero(s: &str) -> Result<u64, String> {
    match s.parse::<u64>() {
        Ok(0) => Err("must be greater than zero".to_owned()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logging(opts.verbose);

    let mut run_config = RunConfig {
        verbose: opts.verbose,
        ..RunConfig::default()
    };
    if let Cmd::Run {
        threads: Some(n), ..
    }
    | Cmd::Emu {
        threads: Some(n), ..
    } = opts.command
    {
        run_config.threads = n;
    }

    let tools = Toolchain::new(
        EnvResolver::from_env(&run_config)?,
        SystemInvoker::new(&run_config),
    );

    match opts.command {
        Cmd::Cc { args } => {
            let runtime = tools.path(Tool::CahpRt)?;
            let extra: [OsString; 5] = [
                "-target".into(),
                "cahp".into(),
                "-Oz".into(),
                "--sysroot".into(),
                runtime.into(),
            ];
            tools.run(Tool::Clang, args.into_iter().chain(extra))
        }
        Cmd::Debug { args } => tools.run(Tool::CahpSim, args),
        Cmd::Genkey { output } => tools.tfhe().genkey(&output),
        Cmd::Enc {
            key,
            input,
            output,
            image,
            args,
        } => do_enc(&tools, &key, &input, &output, &(&image).into(), &args),
        Cmd::PlainEnc {
            input,
            output,
            image,
            args,
        } => {
            let packet = plain_request(&input, &(&image).into(), &args)?;
            write_packet(&packet, &output)
        }
        Cmd::Run {
            cycles,
            input,
            output,
            ..
        } => run_evaluator(
            &tools,
            &run_config,
            &input,
            &output,
            ["-c".into(), cycles.to_string().into()],
        ),
        Cmd::Dec {
            key,
            input,
            json,
            image,
        } => {
            let result = do_dec(&tools, &key, &input, &(&image).into())?;
            print_result(&result, json)
        }
        Cmd::Emu {
            input,
            json,
            image,
            args,
            ..
        } => {
            let result = do_emu(&tools, &run_config, &input, &(&image).into(), &args)?;
            print_result(&result, json)
        }
        Cmd::Show { input, json, image } => {
            let text = std::fs::read_to_string(&input)
                .with_context(|| format!("cannot read {}", input.display()))?;
            let result = PlainResult::from_json(&text, Some(image.ram_size))
                .with_context(|| format!("cannot decode {}", input.display()))?;
            print_result(&result, json)
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_to_end<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let path = path.as_ref();
    std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))
}

fn plain_request(input: &Path, config: &ImageConfig, args: &[String]) -> Result<Packet> {
    let images = kvsp::prepare_images(&read_to_end(input)?, args, config)
        .with_context(|| format!("cannot build images from {}", input.display()))?;

    Ok(Packet::from(PlainRequest {
        ram: config.pack_ram(&images.ram)?,
        rom: images.rom.into_vec(),
    }))
}

fn write_packet(packet: &Packet, output: &Path) -> Result<()> {
    let file =
        File::create(output).with_context(|| format!("cannot create {}", output.display()))?;
    packet.write_to(BufWriter::new(file))?;
    info!("wrote {:?} packet to {}", packet.format(), output.display());
    Ok(())
}

fn read_packet(input: &Path, format: PacketFormat) -> Result<Packet> {
    let file = File::open(input).with_context(|| format!("cannot open {}", input.display()))?;
    Packet::read_from(BufReader::new(file), format)
        .with_context(|| format!("cannot read packet from {}", input.display()))
}

fn do_enc(
    tools: &Tools,
    key: &Path,
    input: &Path,
    output: &Path,
    config: &ImageConfig,
    args: &[String],
) -> Result<()> {
    let images = kvsp::prepare_images(&read_to_end(input)?, args, config)
        .with_context(|| format!("cannot build images from {}", input.display()))?;
    let tfhe = tools.tfhe();

    let rom = tfhe.encrypt(key, &images.rom, ALL_BITS)?;
    let ram = tfhe.encrypt(key, &config.pack_ram(&images.ram)?, ALL_BITS)?;
    let cloud_key = tfhe.cloud_key(key)?;

    let packet = Packet::from(Request {
        cloud_key,
        rom,
        ram,
    });
    write_packet(&packet, output)
}

fn run_evaluator<const N: usize>(
    tools: &Tools,
    config: &RunConfig,
    input: &Path,
    output: &Path,
    extra: [OsString; N],
) -> Result<()> {
    let core = tools.path(Tool::VspCore)?;
    let args: [OsString; 8] = [
        "-t".into(),
        config.threads.to_string().into(),
        "-l".into(),
        core.into(),
        "-i".into(),
        input.into(),
        "-o".into(),
        output.into(),
    ];
    tools.run(Tool::Iyokanl2, args.into_iter().chain(extra))
}

fn do_dec(tools: &Tools, key: &Path, input: &Path, config: &ImageConfig) -> Result<PlainResult> {
    let packet = match read_packet(input, PacketFormat::Response)? {
        Packet::Response(packet) => packet,
        other => anyhow::bail!("expected a response packet, got {:?}", other.format()),
    };
    let tfhe = tools.tfhe();

    let flags = packet
        .flags
        .iter()
        .map(|flag| tfhe.decrypt_bit(key, flag))
        .collect::<Result<Vec<_>>>()?;
    let regs = packet
        .regs
        .iter()
        .map(|reg| tfhe.decrypt_word(key, reg))
        .collect::<Result<Vec<_>>>()?;
    let ram = config.unpack_ram(&tfhe.decrypt(key, &packet.ram, ALL_BITS)?)?;

    Ok(PlainResult::from_values(UNKNOWN_CYCLES, &flags, &regs, ram)?)
}

fn do_emu(
    tools: &Tools,
    run_config: &RunConfig,
    input: &Path,
    config: &ImageConfig,
    args: &[String],
) -> Result<PlainResult> {
    let request = NamedTempFile::new()?;
    plain_request(input, config, args)?.write_to(BufWriter::new(request.as_file()))?;
    let response = NamedTempFile::new()?;

    run_evaluator(
        tools,
        run_config,
        request.path(),
        response.path(),
        ["--plain".into()],
    )?;

    let mut packet = match read_packet(response.path(), PacketFormat::PlainResponse)? {
        Packet::PlainResponse(packet) => packet,
        other => anyhow::bail!("expected a plain response packet, got {:?}", other.format()),
    };
    packet.ram = config.unpack_ram(&packet.ram)?;

    Ok(PlainResult::from_plain_response(&packet)?)
}

fn print_result(result: &PlainResult, json: bool) -> Result<()> {
    if json {
        println!("{}", result.to_json()?);
    } else {
        print!("{result}");
    }
    Ok(())
}
