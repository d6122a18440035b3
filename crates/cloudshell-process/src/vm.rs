use std::path::{Path, PathBuf};

use cloudshell_core::env::env_string_or;

pub const EMULATOR_BINARY: &str = "qemu-system-morello";
pub const DEFAULT_MEMORY: &str = "12G";

/// A resolved program + argv, ready to hand to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl VmCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn display(&self) -> String {
        format!("{} {}", self.program.display(), self.args.join(" "))
    }
}

/// Morello board description. Only the knobs the deployments vary are exposed.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub qemu_root: PathBuf,
    pub image: PathBuf,
    pub memory: String,
    pub smp: usize,
    /// Host loopback port forwarded to the guest's sshd.
    pub ssh_forward_port: u16,
}

impl VmSpec {
    pub fn new(qemu_root: &Path, image: &Path) -> Self {
        Self {
            qemu_root: qemu_root.to_path_buf(),
            image: image.to_path_buf(),
            memory: DEFAULT_MEMORY.to_string(),
            smp: host_cpus(),
            ssh_forward_port: 2222,
        }
    }

    pub fn program(&self) -> PathBuf {
        self.qemu_root.join("bin").join(EMULATOR_BINARY)
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            "-M".to_string(),
            "virt,gic-version=3".to_string(),
            "-cpu".to_string(),
            "morello".to_string(),
            "-smp".to_string(),
            self.smp.max(1).to_string(),
            "-bios".to_string(),
            "edk2-aarch64-code.fd".to_string(),
            "-m".to_string(),
            self.memory.clone(),
            "-nographic".to_string(),
            "-drive".to_string(),
            format!("if=none,file={},id=drv,format=raw", self.image.display()),
            "-device".to_string(),
            "virtio-blk-pci,drive=drv".to_string(),
            "-device".to_string(),
            "virtio-net-pci,netdev=net0".to_string(),
            "-netdev".to_string(),
            format!(
                "user,id=net0,hostfwd=tcp:127.0.0.1:{}-:22",
                self.ssh_forward_port
            ),
            "-device".to_string(),
            "virtio-rng-pci".to_string(),
        ]
    }

    pub fn command(&self) -> VmCommand {
        VmCommand::new(self.program(), self.args())
    }
}

pub fn host_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// `CLOUDSHELL_VM_MEMORY`, falling back to [`DEFAULT_MEMORY`].
pub fn memory_from_env() -> String {
    env_string_or("CLOUDSHELL_VM_MEMORY", DEFAULT_MEMORY)
}
