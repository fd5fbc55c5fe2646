use std::rc::Rc;

use rand::RngCore;

use crate::runtime::RuntimeBase;

/// Deterministic random generator scoped to one runtime.
///
/// Seeded from the host on first use, so every node running the same
/// execution draws the same sequence in DON mode. All handles obtained from
/// the same runtime share one stream.
///
/// # Panics
///
/// Drawing from a `Rand` after its runtime has been poisoned panics. A
/// generator must not leave the mode it was created in.
pub struct Rand {
  owner: Rc<RuntimeBase>,
}

impl Rand {
  pub(crate) fn new(owner: Rc<RuntimeBase>) -> Self {
    Self { owner }
  }

  fn with_rng<R>(&mut self, f: impl FnOnce(&mut rand::rngs::StdRng) -> R) -> R {
    if let Err(e) = self.owner.check() {
      panic!("random generator used outside of its mode: {}", e);
    }
    self.owner.with_rng(f)
  }
}

impl RngCore for Rand {
  fn next_u32(&mut self) -> u32 {
    self.with_rng(|rng| rng.next_u32())
  }

  fn next_u64(&mut self) -> u64 {
    self.with_rng(|rng| rng.next_u64())
  }

  fn fill_bytes(&mut self, dest: &mut [u8]) {
    self.with_rng(|rng| rng.fill_bytes(dest))
  }

  fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
    self.with_rng(|rng| rng.try_fill_bytes(dest))
  }
}
