//! Orchestrates C1..C6 and selects between the custom pipeline and a
//! system compiler driver shellout (C7, spec §4.7).

use crate::context::LinkerContext;
use crate::error::{LinkError, LinkErrors};
use crate::link::{layout, relocate, symbols};
use crate::object::reader::read_object;
use crate::target::{Arch, Os, Target};
use crate::write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    System,
    Custom,
    Auto,
}

pub struct LinkJob<'a> {
    pub input: &'a Path,
    pub output: PathBuf,
    pub target: Target,
    pub mode: Mode,
    pub link_runtime: bool,
    pub emit_object_only: bool,
}

/// Candidate paths searched, in order, for the prebuilt runtime archive
/// (spec §4.7 "Runtime archive lookup").
fn runtime_archive_candidates(arch: Arch) -> Vec<PathBuf> {
    let arch_name = match arch {
        Arch::X86_64 => "x86_64",
        Arch::Arm64 => "arm64",
    };
    vec![
        PathBuf::from(format!("./build/libsox_runtime_{arch_name}.a")),
        PathBuf::from("./build/libsox_runtime.a"),
        PathBuf::from(format!("./build/debug/libsox_runtime_{arch_name}.a")),
        PathBuf::from(format!("./build/release/libsox_runtime_{arch_name}.a")),
        PathBuf::from("./target/sox_runtime/libsox_runtime.a"),
    ]
}

fn find_runtime_archive(arch: Arch) -> Option<PathBuf> {
    runtime_archive_candidates(arch).into_iter().find(|p| p.exists())
}

/// Scan `PATH` for a `<arch>-<os>-gnu-{gcc,clang}` cross-compiler prefix,
/// falling back to the native driver (spec §4.7 "System" mode).
fn find_system_linker_driver(target: Target) -> String {
    if target.os == Os::MacOs {
        return "clang".to_string();
    }
    let arch_name = match target.arch {
        Arch::X86_64 => "x86_64",
        Arch::Arm64 => "aarch64",
    };
    let prefix = format!("{arch_name}-linux-gnu-");
    for candidate in [format!("{prefix}gcc"), format!("{prefix}clang")] {
        if which(&candidate) {
            return candidate;
        }
    }
    "gcc".to_string()
}

fn which(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(program).is_file())
        })
        .unwrap_or(false)
}

fn dynamic_linker_path(target: Target) -> &'static str {
    match (target.os, target.arch) {
        (Os::Linux, Arch::X86_64) => "/lib64/ld-linux-x86-64.so.2",
        (Os::Linux, Arch::Arm64) => "/lib/ld-linux-aarch64.so.1",
        (Os::MacOs, _) => "/usr/lib/dyld",
    }
}

fn run_system_linker(job: &LinkJob<'_>) -> Result<(), LinkErrors> {
    let driver = find_system_linker_driver(job.target);
    let mut cmd = Command::new(&driver);
    cmd.arg(job.input).arg("-o").arg(&job.output).arg("-pie");
    cmd.arg(format!("-Wl,-dynamic-linker,{}", dynamic_linker_path(job.target)));
    if job.link_runtime {
        if let Some(archive) = find_runtime_archive(job.target.arch) {
            if let Some(dir) = archive.parent() {
                cmd.arg(format!("-L{}", dir.display()));
            }
            cmd.arg("-lsox_runtime");
        } else {
            return Err(LinkErrors::from(LinkError::Archive {
                file: "libsox_runtime".to_string(),
                message: "no candidate runtime archive path exists".to_string(),
            }));
        }
    }
    info!(driver = %driver, "invoking system linker");
    let status = cmd.status().map_err(|source| {
        LinkErrors::from(LinkError::Io {
            file: driver.clone(),
            source,
        })
    })?;
    if !status.success() {
        return Err(LinkErrors::from(LinkError::Archive {
            file: driver,
            message: format!("system linker exited with {status}"),
        }));
    }
    Ok(())
}

fn run_custom_pipeline(job: &LinkJob<'_>) -> Result<(), LinkErrors> {
    let mut ctx = LinkerContext::new(job.target);

    let main_object = read_object(job.input).map_err(LinkErrors::from)?;
    ctx.add_object(main_object);
    debug!(file = %job.input.display(), "parsed primary object");

    if job.link_runtime {
        match find_runtime_archive(job.target.arch) {
            Some(archive) => {
                let count = crate::archive::extract(&archive, &mut ctx)?;
                debug!(archive = %archive.display(), count, "extracted runtime archive objects");
            }
            None => {
                return Err(LinkErrors::from(LinkError::Archive {
                    file: "libsox_runtime".to_string(),
                    message: "no candidate runtime archive path exists".to_string(),
                }));
            }
        }
    }

    symbols::resolve(&mut ctx)?;
    layout::merge_and_place(&mut ctx);
    layout::compute_addresses(&mut ctx);
    let reloc_errors = relocate::apply_relocations(&mut ctx);
    reloc_errors.into_result()?;

    match job.target.format() {
        crate::object::model::PlatformFormat::Elf => {
            write::elf::write_elf_executable(&mut ctx).map_err(LinkErrors::from)?;
        }
        crate::object::model::PlatformFormat::MachO => {
            write::macho::write_macho_executable(&mut ctx).map_err(LinkErrors::from)?;
        }
        crate::object::model::PlatformFormat::Pe => {
            return Err(LinkErrors::from(LinkError::UnsupportedFormat {
                file: job.input.display().to_string(),
                message: "PE/COFF output is not implemented".to_string(),
            }));
        }
    }

    write_output_file(&job.output, &ctx.executable_bytes)?;
    info!(output = %job.output.display(), entry = format_args!("{:#x}", ctx.entry_point), "link complete");
    Ok(())
}

fn write_output_file(path: &Path, bytes: &[u8]) -> Result<(), LinkErrors> {
    std::fs::write(path, bytes).map_err(|source| {
        LinkErrors::from(LinkError::Io {
            file: path.display().to_string(),
            source,
        })
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(|source| {
            LinkErrors::from(LinkError::Io {
                file: path.display().to_string(),
                source,
            })
        })?;
    }
    Ok(())
}

/// Whether `job` qualifies as "simple" for Auto mode: a single primary
/// input, a supported target, and a locatable runtime archive (spec §4.7;
/// the multi-input redesign flagged in spec §9 note 4 is out of scope —
/// this predicate only ever sees one input path by construction).
fn is_simple_job(job: &LinkJob<'_>) -> bool {
    !job.link_runtime || find_runtime_archive(job.target.arch).is_some()
}

pub fn run(job: LinkJob<'_>) -> Result<(), LinkErrors> {
    if job.emit_object_only {
        return Err(LinkErrors::from(LinkError::UnsupportedFormat {
            file: job.input.display().to_string(),
            message: "--native-obj bypasses the linker; nothing for the driver to do".to_string(),
        }));
    }

    let effective_mode = match job.mode {
        Mode::Auto if is_simple_job(&job) => Mode::Custom,
        Mode::Auto => Mode::System,
        other => other,
    };

    match effective_mode {
        Mode::Custom => run_custom_pipeline(&job),
        Mode::System | Mode::Auto => run_system_linker(&job),
    }
    .map_err(|errors| {
        let _ = std::fs::remove_file(&job.output);
        errors
    })
}
