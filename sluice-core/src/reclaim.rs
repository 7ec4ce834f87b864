use candle_core::Device;

/// Best-effort memory reclaimer, invoked at every phase boundary.
///
/// candle frees tensor storage when the last reference drops, but on CUDA the
/// freed blocks sit in the allocator's cache until the stream catches up.
/// Synchronizing the accelerator here makes sure the blocks released by the
/// previous staging step are actually reusable before the next one starts
/// allocating. There is deliberately no error path: a failed synchronize only
/// costs us the early release, never the request.
#[derive(Clone, Debug)]
pub struct Reclaimer {
    accelerator: Device,
}

impl Reclaimer {
    pub fn new(accelerator: Device) -> Self {
        Self { accelerator }
    }

    pub fn reclaim(&self) {
        if let Err(e) = self.accelerator.synchronize() {
            tracing::debug!("device synchronize during reclaim failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reclaim_on_cpu_is_a_noop() {
        let reclaimer = Reclaimer::new(Device::Cpu);
        reclaimer.reclaim();
        reclaimer.reclaim();
    }
}
