//! Command-line surface (spec §6) and the typed, validated configuration
//! built from it.

use crate::driver::Mode;
use crate::target::{Arch, Os, Target};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use typed_builder::TypedBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliArch {
    #[value(alias = "x64")]
    X86_64,
    #[value(alias = "aarch64")]
    Arm64,
}

impl From<CliArch> for Arch {
    fn from(value: CliArch) -> Self {
        match value {
            CliArch::X86_64 => Arch::X86_64,
            CliArch::Arm64 => Arch::Arm64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliOs {
    Linux,
    #[value(alias = "darwin")]
    Macos,
    #[value(alias = "win32")]
    Windows,
}

#[derive(Parser, Debug)]
#[command(name = "sox-link", about = "Static linker for the sox toolchain")]
pub struct Cli {
    /// Relocatable object file to link.
    pub input: PathBuf,

    #[arg(long = "native-out")]
    pub native_out: Option<PathBuf>,

    #[arg(long = "native-arch")]
    pub native_arch: Option<CliArch>,

    #[arg(long = "native-os")]
    pub native_os: Option<CliOs>,

    /// Emit an object file only; bypasses the linker.
    #[arg(long = "native-obj")]
    pub native_obj: bool,

    /// Verbose phase logging to stderr.
    #[arg(long = "native-debug")]
    pub native_debug: bool,

    /// Forwarded to codegen; ignored by the linker.
    #[arg(long = "native-opt", value_parser = clap::value_parser!(u8).range(0..=3))]
    pub native_opt: Option<u8>,

    #[arg(long = "custom-linker", conflicts_with = "system_linker")]
    pub custom_linker: bool,

    #[arg(long = "system-linker", conflicts_with = "custom_linker")]
    pub system_linker: bool,

    /// Skip extracting and linking the sox runtime archive (test harnesses
    /// that provide every symbol already satisfied).
    #[arg(long = "no-runtime", hide = true)]
    pub no_runtime: bool,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct LinkerConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub target: Target,
    pub mode: Mode,
    #[builder(default = true)]
    pub link_runtime: bool,
    #[builder(default = false)]
    pub emit_object_only: bool,
    #[builder(default = false)]
    pub debug: bool,
}

fn host_target() -> Target {
    let arch = if cfg!(target_arch = "aarch64") {
        Arch::Arm64
    } else {
        Arch::X86_64
    };
    let os = if cfg!(target_os = "macos") { Os::MacOs } else { Os::Linux };
    Target { arch, os }
}

impl Cli {
    pub fn into_config(self) -> Result<LinkerConfig, String> {
        let arch: Arch = self.native_arch.map(Into::into).unwrap_or_else(|| host_target().arch);
        let os = match self.native_os {
            Some(CliOs::Linux) => Os::Linux,
            Some(CliOs::Macos) => Os::MacOs,
            Some(CliOs::Windows) => {
                return Err("Windows/PE targets are not supported by this linker".to_string())
            }
            None => host_target().os,
        };
        let target = Target { arch, os };

        let output = self.native_out.clone().unwrap_or_else(|| {
            let mut out = self.input.clone();
            out.set_extension("");
            out
        });

        let mode = if self.custom_linker {
            Mode::Custom
        } else if self.system_linker {
            Mode::System
        } else {
            Mode::Auto
        };

        Ok(LinkerConfig::builder()
            .input(self.input)
            .output(output)
            .target(target)
            .mode(mode)
            .link_runtime(!self.no_runtime)
            .emit_object_only(self.native_obj)
            .debug(self.native_debug)
            .build())
    }
}
