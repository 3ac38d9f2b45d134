//! Seccomp syscall filtering via classic BPF.
//!
//! A resolved [`SeccompProfile`] is compiled into a short BPF program: an
//! architecture guard, one equality test per rule, and the profile's
//! default action as the tail. Installation sets `no_new_privs` first so
//! the filter can be loaded without `CAP_SYS_ADMIN`, and happens last in
//! the bootstrap, immediately before exec, so it cannot interfere with
//! earlier steps' own syscalls.

use capstan_common::error::{CapstanError, Result};
use capstan_common::spec::{SeccompAction, SeccompProfile};

/// One classic-BPF instruction, layout-compatible with the kernel's
/// `struct sock_filter`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FilterInsn {
    code: u16,
    jt: u8,
    jf: u8,
    k: u32,
}

const fn insn(code: u16, jt: u8, jf: u8, k: u32) -> FilterInsn {
    FilterInsn { code, jt, jf, k }
}

// BPF opcodes: BPF_LD|BPF_W|BPF_ABS, BPF_JMP|BPF_JEQ|BPF_K, BPF_RET|BPF_K.
const OP_LOAD_ABS: u16 = 0x20;
const OP_JEQ: u16 = 0x15;
const OP_RET: u16 = 0x06;

// Offsets into the kernel's seccomp_data.
const DATA_NR_OFFSET: u32 = 0;
const DATA_ARCH_OFFSET: u32 = 4;

// Filter return values.
const RET_ALLOW: u32 = 0x7fff_0000;
const RET_LOG: u32 = 0x7ffc_0000;
const RET_TRAP: u32 = 0x0003_0000;
const RET_ERRNO_BASE: u32 = 0x0005_0000;
const RET_KILL_THREAD: u32 = 0x0000_0000;
const RET_KILL_PROCESS: u32 = 0x8000_0000;

// seccomp(2) operation; predates the constant's arrival in libc.
#[cfg(target_os = "linux")]
const SECCOMP_SET_MODE_FILTER: libc::c_uint = 1;

/// AUDIT_ARCH value for the build architecture, if supported.
fn native_audit_arch() -> Option<u32> {
    #[cfg(target_arch = "x86_64")]
    {
        Some(0xC000_003E)
    }
    #[cfg(target_arch = "aarch64")]
    {
        Some(0xC000_00B7)
    }
    #[cfg(target_arch = "riscv64")]
    {
        Some(0xC000_00F3)
    }
    #[cfg(not(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "riscv64"
    )))]
    {
        None
    }
}

fn action_value(action: SeccompAction) -> u32 {
    match action {
        SeccompAction::Allow => RET_ALLOW,
        SeccompAction::Errno(errno) => RET_ERRNO_BASE | u32::from(errno),
        SeccompAction::Kill => RET_KILL_THREAD,
        SeccompAction::Trap => RET_TRAP,
        SeccompAction::Log => RET_LOG,
    }
}

/// Compiles a profile into a BPF instruction stream.
///
/// Layout: load arch, guard it (mismatch kills the process), load the
/// syscall number, one `jeq`/`ret` pair per rule, and the default action.
fn emit(profile: &SeccompProfile) -> Result<Vec<FilterInsn>> {
    let arch = native_audit_arch().ok_or(CapstanError::Unsupported {
        operation: "seccomp on this architecture",
    })?;

    let mut program = Vec::with_capacity(5 + profile.rules.len() * 2);
    program.push(insn(OP_LOAD_ABS, 0, 0, DATA_ARCH_OFFSET));
    program.push(insn(OP_JEQ, 1, 0, arch));
    program.push(insn(OP_RET, 0, 0, RET_KILL_PROCESS));
    program.push(insn(OP_LOAD_ABS, 0, 0, DATA_NR_OFFSET));
    for rule in &profile.rules {
        let nr = u32::try_from(rule.nr).map_err(|_| CapstanError::Config {
            message: format!("syscall number out of range: {}", rule.nr),
        })?;
        program.push(insn(OP_JEQ, 0, 1, nr));
        program.push(insn(OP_RET, 0, 0, action_value(rule.action)));
    }
    program.push(insn(OP_RET, 0, 0, action_value(profile.default_action)));
    Ok(program)
}

/// Sets the no-new-privileges attribute for the calling process.
#[cfg(target_os = "linux")]
fn set_no_new_privs() -> Result<()> {
    // SAFETY: PR_SET_NO_NEW_PRIVS with 1 takes no memory arguments.
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(CapstanError::bootstrap(
            "SeccompLoaded",
            format!("PR_SET_NO_NEW_PRIVS: {}", std::io::Error::last_os_error()),
        ));
    }
    Ok(())
}

/// Installs the profile's filter for the calling process.
///
/// An empty profile (allow-all with no rules) installs nothing. Otherwise
/// `no_new_privs` is set and the program is loaded through `seccomp(2)`,
/// falling back to `prctl(PR_SET_SECCOMP)` on kernels without the newer
/// syscall.
///
/// # Errors
///
/// Returns an error if the program cannot be emitted or the kernel
/// rejects the filter.
#[cfg(target_os = "linux")]
pub fn install(profile: &SeccompProfile) -> Result<()> {
    if profile.is_empty() {
        tracing::debug!("empty seccomp profile, no filter installed");
        return Ok(());
    }

    set_no_new_privs()?;
    let program = emit(profile)?;
    let len = u16::try_from(program.len()).map_err(|_| CapstanError::Config {
        message: format!("seccomp program too long: {} instructions", program.len()),
    })?;
    let prog = libc::sock_fprog {
        len,
        // FilterInsn is layout-compatible with sock_filter.
        filter: program.as_ptr().cast::<libc::sock_filter>().cast_mut(),
    };

    // SAFETY: prog points at a valid program for the duration of the call;
    // the kernel copies the instructions.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            0 as libc::c_uint,
            &raw const prog,
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOSYS) {
            // SAFETY: same program, loaded through the older prctl path.
            let rc = unsafe {
                libc::prctl(libc::PR_SET_SECCOMP, libc::SECCOMP_MODE_FILTER, &raw const prog)
            };
            if rc != 0 {
                return Err(CapstanError::bootstrap(
                    "SeccompLoaded",
                    format!("prctl(PR_SET_SECCOMP): {}", std::io::Error::last_os_error()),
                ));
            }
        } else {
            return Err(CapstanError::bootstrap(
                "SeccompLoaded",
                format!("seccomp(SET_MODE_FILTER): {err}"),
            ));
        }
    }

    tracing::info!(
        rules = profile.rules.len(),
        instructions = program.len(),
        "seccomp filter installed"
    );
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — seccomp requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn install(profile: &SeccompProfile) -> Result<()> {
    if profile.is_empty() {
        return Ok(());
    }
    Err(CapstanError::Unsupported {
        operation: "seccomp filtering",
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use super::*;
    use capstan_common::spec::SyscallRule;

    #[test]
    fn program_opens_with_the_architecture_guard() {
        let program = emit(&SeccompProfile::allow_all()).expect("emit");
        assert_eq!(program[0], insn(OP_LOAD_ABS, 0, 0, DATA_ARCH_OFFSET));
        assert_eq!(program[1].code, OP_JEQ);
        assert_eq!(program[1].jt, 1);
        assert_eq!(program[2], insn(OP_RET, 0, 0, RET_KILL_PROCESS));
        assert_eq!(program[3], insn(OP_LOAD_ABS, 0, 0, DATA_NR_OFFSET));
    }

    #[test]
    fn rules_become_jeq_ret_pairs_in_order() {
        let profile = SeccompProfile {
            default_action: SeccompAction::Allow,
            rules: vec![
                SyscallRule {
                    nr: 41,
                    action: SeccompAction::Errno(1),
                },
                SyscallRule {
                    nr: 59,
                    action: SeccompAction::Kill,
                },
            ],
        };
        let program = emit(&profile).expect("emit");
        // Guard (4) + two pairs + default tail.
        assert_eq!(program.len(), 9);
        assert_eq!(program[4], insn(OP_JEQ, 0, 1, 41));
        assert_eq!(program[5], insn(OP_RET, 0, 0, RET_ERRNO_BASE | 1));
        assert_eq!(program[6], insn(OP_JEQ, 0, 1, 59));
        assert_eq!(program[7], insn(OP_RET, 0, 0, RET_KILL_THREAD));
        assert_eq!(program[8], insn(OP_RET, 0, 0, RET_ALLOW));
    }

    #[test]
    fn default_action_is_the_tail() {
        let profile = SeccompProfile {
            default_action: SeccompAction::Errno(38),
            rules: vec![SyscallRule {
                nr: 0,
                action: SeccompAction::Allow,
            }],
        };
        let program = emit(&profile).expect("emit");
        let tail = program.last().expect("tail");
        assert_eq!(tail.k, RET_ERRNO_BASE | 38);
    }

    #[test]
    fn negative_syscall_numbers_are_rejected() {
        let profile = SeccompProfile {
            default_action: SeccompAction::Allow,
            rules: vec![SyscallRule {
                nr: -1,
                action: SeccompAction::Kill,
            }],
        };
        assert!(emit(&profile).is_err());
    }
}
