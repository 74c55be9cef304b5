use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const SHADER_SOURCE: &str = "src/platform/windows/tonemap_cs.hlsl";

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed={SHADER_SOURCE}");
    println!("cargo:rustc-check-cfg=cfg(has_precompiled_tonemap)");
    println!("cargo:rerun-if-env-changed=TONEMAP_CAPTURE_FXC_PATH");
    println!("cargo:rerun-if-env-changed=TONEMAP_CAPTURE_PRECOMPILE_SHADER");

    if env::var("CARGO_CFG_TARGET_OS").unwrap_or_default() != "windows" {
        return;
    }

    let hlsl_path = PathBuf::from(SHADER_SOURCE);
    if !hlsl_path.exists() {
        return;
    }

    // TONEMAP_CAPTURE_PRECOMPILE_SHADER=0 leaves compilation to D3DCompile
    // on first use.
    if !precompile_enabled() {
        println!(
            "cargo:warning=TONEMAP_CAPTURE_PRECOMPILE_SHADER is disabled; the tone-map shader is compiled at runtime"
        );
        return;
    }

    let Ok(out_dir) = env::var("OUT_DIR") else {
        return;
    };
    let cso_path = PathBuf::from(out_dir).join("tonemap_cs.cso");
    match compile_with_fxc(&hlsl_path, &cso_path, "main") {
        Ok(()) => {
            println!("cargo:rustc-env=TONEMAP_CSO_PATH={}", cso_path.display());
            println!("cargo:rustc-cfg=has_precompiled_tonemap");
        }
        Err(detail) => {
            println!(
                "cargo:warning=fxc could not precompile the tone-map shader ({detail}); falling back to runtime compilation"
            );
        }
    }
}

fn precompile_enabled() -> bool {
    env::var("TONEMAP_CAPTURE_PRECOMPILE_SHADER")
        .map(|value| {
            !matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "no" | "off"
            )
        })
        .unwrap_or(true)
}

/// Tries each fxc candidate in turn; the first successful compile wins.
fn compile_with_fxc(hlsl_path: &Path, cso_path: &Path, entry_point: &str) -> Result<(), String> {
    let candidates: Vec<PathBuf> = fxc_candidates()
        .into_iter()
        .filter(|fxc| resolved_through_path(fxc) || fxc.is_file())
        .collect();
    if candidates.is_empty() {
        return Err(
            "fxc.exe not found on PATH or in a Windows SDK; set TONEMAP_CAPTURE_FXC_PATH".into(),
        );
    }

    let mut failures = Vec::with_capacity(candidates.len());
    for fxc in &candidates {
        let result = Command::new(fxc)
            .args(["/nologo", "/T", "cs_5_0", "/E", entry_point, "/O3", "/Fo"])
            .arg(cso_path)
            .arg(hlsl_path)
            .output();
        match result {
            Ok(output) if output.status.success() => return Ok(()),
            Ok(output) => failures.push(format!("{}: {}", fxc.display(), diagnostic(&output))),
            Err(err) => failures.push(format!("{}: {err}", fxc.display())),
        }
    }
    Err(failures.join("; "))
}

/// A bare `fxc.exe` is left to the OS search path.
fn resolved_through_path(path: &Path) -> bool {
    path.parent().is_none_or(|parent| parent.as_os_str().is_empty())
        && path
            .file_name()
            .is_some_and(|name| name.eq_ignore_ascii_case("fxc.exe"))
}

fn diagnostic(output: &Output) -> String {
    const MAX_LEN: usize = 240;

    let status = match output.status.code() {
        Some(code) => format!("exit {code}"),
        None => "terminated".to_string(),
    };
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let text = [stderr.trim(), stdout.trim()]
        .into_iter()
        .find(|text| !text.is_empty())
        .unwrap_or("no output");
    let text: String = text.chars().take(MAX_LEN).collect();
    format!("{status}: {text}")
}

fn fxc_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    let explicit = env::var("TONEMAP_CAPTURE_FXC_PATH").unwrap_or_default();
    if !explicit.trim().is_empty() {
        candidates.push(PathBuf::from(explicit.trim()));
    }
    candidates.push(PathBuf::from("fxc.exe"));

    // Set inside a Visual Studio developer prompt.
    if let Ok(bin) = env::var("WindowsSdkVerBinPath") {
        push_arch_dirs(&mut candidates, PathBuf::from(bin));
    }
    if let (Ok(dir), Ok(version)) = (env::var("WindowsSdkDir"), env::var("WindowsSDKVersion")) {
        let version = version.trim_matches(['\\', '/']);
        if !version.is_empty() {
            push_arch_dirs(&mut candidates, PathBuf::from(dir).join("bin").join(version));
        }
    }
    for sdk_bin in installed_sdk_bins() {
        push_arch_dirs(&mut candidates, sdk_bin);
    }

    let mut unique = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !unique.contains(&candidate) {
            unique.push(candidate);
        }
    }
    unique
}

fn push_arch_dirs(candidates: &mut Vec<PathBuf>, bin: PathBuf) {
    for arch in ["x64", "x86"] {
        candidates.push(bin.join(arch).join("fxc.exe"));
    }
}

/// Versioned `Windows Kits\10\bin` directories, newest first.
fn installed_sdk_bins() -> Vec<PathBuf> {
    let Ok(program_files) = env::var("ProgramFiles(x86)") else {
        return Vec::new();
    };
    let root = Path::new(&program_files).join("Windows Kits").join("10").join("bin");
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort_unstable_by(|a, b| b.cmp(a));
    dirs
}
