use sysinfo::System;

/// Reports system memory pressure.
pub trait MemoryProbe: Send {
    /// Used memory as a percentage of total, if it can be read.
    fn used_percent(&mut self) -> Option<f32>;
}

impl<F> MemoryProbe for F
where
    F: FnMut() -> Option<f32> + Send,
{
    fn used_percent(&mut self) -> Option<f32> {
        self()
    }
}

/// Host memory via `sysinfo`.
pub struct SystemMemory {
    system: System,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemory {
    fn used_percent(&mut self) -> Option<f32> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return None;
        }
        Some((self.system.used_memory() as f64 / total as f64 * 100.0) as f32)
    }
}
