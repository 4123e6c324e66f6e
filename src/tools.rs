//! External tools: where they live and how they are run.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use anyhow::{anyhow, bail, Context, Result};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::config::RunConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Clang,
    Tfheutil,
    CahpSim,
    CahpRt,
    Iyokanl2,
    VspCore,
}

impl Tool {
    pub const ALL: [Tool; 6] = [
        Tool::Clang,
        Tool::Tfheutil,
        Tool::CahpSim,
        Tool::CahpRt,
        Tool::Iyokanl2,
        Tool::VspCore,
    ];

    /// Environment variable overriding the tool location.
    pub fn env_var(self) -> &'static str {
        match self {
            Tool::Clang => "KVSP_CLANG_PATH",
            Tool::Tfheutil => "KVSP_TFHEUTIL_PATH",
            Tool::CahpSim => "KVSP_CAHP_SIM_PATH",
            Tool::CahpRt => "KVSP_CAHP_RT_PATH",
            Tool::Iyokanl2 => "KVSP_IYOKANL2_PATH",
            Tool::VspCore => "KVSP_VSPCORE_PATH",
        }
    }

    /// Location relative to the directory of the running executable.
    pub fn default_path(self) -> &'static str {
        match self {
            Tool::Clang => "clang",
            Tool::Tfheutil => "tfheutil",
            Tool::CahpSim => "cahp-sim",
            Tool::CahpRt => "../share/kvsp/cahp-rt",
            Tool::Iyokanl2 => "iyokanl2",
            Tool::VspCore => "../share/kvsp/vsp-core.json",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tool::Clang => "clang",
            Tool::Tfheutil => "tfheutil",
            Tool::CahpSim => "cahp-sim",
            Tool::CahpRt => "cahp-rt",
            Tool::Iyokanl2 => "iyokanl2",
            Tool::VspCore => "vsp-core",
        };
        f.write_str(name)
    }
}

pub trait PathResolver {
    fn resolve(&self, tool: Tool) -> Result<PathBuf>;
}

pub trait ProcessInvoker {
    /// Runs `program` with inherited stdio and waits for it.
    fn invoke(&self, program: &Path, args: &[OsString]) -> Result<ExitStatus>;
}

/// Looks tools up in `KVSP_*_PATH` overrides, then next to the executable.
#[derive(Debug, Clone)]
pub struct EnvResolver {
    base_dir: PathBuf,
    overrides: HashMap<Tool, PathBuf>,
    verbose: bool,
}

impl EnvResolver {
    pub fn new(base_dir: impl Into<PathBuf>, config: &RunConfig) -> Self {
        Self {
            base_dir: base_dir.into(),
            overrides: HashMap::new(),
            verbose: config.verbose,
        }
    }

    /// Captures the current environment, relative to the running executable.
    pub fn from_env(config: &RunConfig) -> Result<Self> {
        let exe = std::env::current_exe().context("cannot locate the kvsp executable")?;
        let base_dir = exe
            .parent()
            .ok_or_else(|| anyhow!("executable path {} has no parent", exe.display()))?;

        let mut resolver = Self::new(base_dir, config);
        for tool in Tool::ALL {
            if let Some(path) = std::env::var_os(tool.env_var()).filter(|p| !p.is_empty()) {
                resolver = resolver.with_override(tool, path);
            }
        }
        Ok(resolver)
    }

    pub fn with_override(mut self, tool: Tool, path: impl Into<PathBuf>) -> Self {
        self.overrides.insert(tool, path.into());
        self
    }
}

impl PathResolver for EnvResolver {
    fn resolve(&self, tool: Tool) -> Result<PathBuf> {
        let path = match self.overrides.get(&tool) {
            Some(path) => path.clone(),
            None => self.base_dir.join(tool.default_path()),
        };

        if !path.exists() {
            bail!("{} not found at {}", tool, path.display());
        }
        if self.verbose {
            info!("{} resolved to {}", tool, path.display());
        }
        Ok(path)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInvoker {
    verbose: bool,
}

impl SystemInvoker {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            verbose: config.verbose,
        }
    }

    /// Writes the command line to `out` when verbose, independent of log filtering.
    fn echo<W: Write>(
        &self,
        mut out: W,
        program: &Path,
        args: &[OsString],
    ) -> std::io::Result<()> {
        if !self.verbose {
            return Ok(());
        }
        let line = std::iter::once(program.as_os_str())
            .chain(args.iter().map(OsString::as_os_str))
            .map(OsStr::to_string_lossy)
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(out, "exec: {line}")
    }
}

impl ProcessInvoker for SystemInvoker {
    fn invoke(&self, program: &Path, args: &[OsString]) -> Result<ExitStatus> {
        self.echo(std::io::stderr().lock(), program, args)?;

        Command::new(program)
            .args(args)
            .status()
            .with_context(|| format!("failed to spawn {}", program.display()))
    }
}

/// A resolver and an invoker used together.
pub struct Toolchain<R, I> {
    pub resolver: R,
    pub invoker: I,
}

impl<R: PathResolver, I: ProcessInvoker> Toolchain<R, I> {
    pub fn new(resolver: R, invoker: I) -> Self {
        Self { resolver, invoker }
    }

    pub fn path(&self, tool: Tool) -> Result<PathBuf> {
        self.resolver.resolve(tool)
    }

    /// Runs `tool`, failing unless it exits successfully.
    pub fn run<A, S>(&self, tool: Tool, args: A) -> Result<()>
    where
        A: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let program = self.path(tool)?;
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        debug!("running {} with {} arguments", tool, args.len());

        let status = self.invoker.invoke(&program, &args)?;
        if !status.success() {
            bail!("{} failed with {}", tool, status);
        }
        Ok(())
    }

    pub fn tfhe(&self) -> Tfhe<'_, R, I> {
        Tfhe { toolchain: self }
    }
}

/// Key generation, encryption and decryption through `tfheutil`.
///
/// Data crosses the process boundary in temporary files that are removed
/// when they go out of scope.
pub struct Tfhe<'a, R, I> {
    toolchain: &'a Toolchain<R, I>,
}

/// Bit count understood by `tfheutil` as "the whole input".
pub const ALL_BITS: i64 = -1;

impl<R: PathResolver, I: ProcessInvoker> Tfhe<'_, R, I> {
    pub fn genkey(&self, output: &Path) -> Result<()> {
        self.toolchain
            .run(Tool::Tfheutil, [OsStr::new("genkey"), output.as_os_str()])
    }

    pub fn cloud_key(&self, secret_key: &Path) -> Result<Vec<u8>> {
        let out = NamedTempFile::new()?;
        self.toolchain.run(
            Tool::Tfheutil,
            [
                OsStr::new("cloudkey"),
                secret_key.as_os_str(),
                out.path().as_os_str(),
            ],
        )?;
        read_back(&out)
    }

    pub fn encrypt(&self, secret_key: &Path, plain: &[u8], nbits: i64) -> Result<Vec<u8>> {
        self.transform("enc", secret_key, plain, nbits)
    }

    pub fn decrypt(&self, secret_key: &Path, cipher: &[u8], nbits: i64) -> Result<Vec<u8>> {
        self.transform("dec", secret_key, cipher, nbits)
    }

    pub fn decrypt_bit(&self, secret_key: &Path, cipher: &[u8]) -> Result<bool> {
        let plain = self.decrypt(secret_key, cipher, 1)?;
        match plain.as_slice() {
            [byte] => Ok(byte & 1 != 0),
            other => bail!("tfheutil returned {} bytes for one bit", other.len()),
        }
    }

    /// Decrypts a 16-bit little-endian word.
    pub fn decrypt_word(&self, secret_key: &Path, cipher: &[u8]) -> Result<u16> {
        let plain = self.decrypt(secret_key, cipher, 16)?;
        match plain.as_slice() {
            [lo, hi] => Ok(u16::from_le_bytes([*lo, *hi])),
            other => bail!("tfheutil returned {} bytes for one word", other.len()),
        }
    }

    fn transform(&self, mode: &str, secret_key: &Path, input: &[u8], nbits: i64) -> Result<Vec<u8>> {
        let mut src = NamedTempFile::new()?;
        src.write_all(input)?;
        src.flush()?;
        let dst = NamedTempFile::new()?;
        debug!(
            "tfheutil {} {} bytes via {}",
            mode,
            input.len(),
            src.path().display()
        );

        self.toolchain.run(
            Tool::Tfheutil,
            [
                OsString::from(mode),
                secret_key.as_os_str().to_owned(),
                src.path().as_os_str().to_owned(),
                dst.path().as_os_str().to_owned(),
                OsString::from(nbits.to_string()),
            ],
        )?;
        read_back(&dst)
    }
}

fn read_back(file: &NamedTempFile) -> Result<Vec<u8>> {
    std::fs::read(file.path())
        .with_context(|| format!("cannot read tool output {}", file.path().display()))
}
