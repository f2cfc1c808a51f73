//! In-memory devices for exercising sessions without a radio
//!
//! [`FakePeripheral`] plays a callback driven native stack and
//! [`FakeAsyncStack`] an awaitable one. Both keep a log of the native calls
//! they received so tests can check exactly what reached the "hardware".

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;

use crate::backend::{BackendProvider, NativeDevice};
use crate::{Address, Result};

mod peripheral;
pub use peripheral::{FakeCall, FakePeripheral};

mod async_stack;
pub use async_stack::FakeAsyncStack;

/// Hands out registered fake peripherals by address
#[derive(Debug, Default)]
pub struct FakeProvider {
    peripherals: Mutex<HashMap<Address, FakePeripheral>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, address: Address, peripheral: FakePeripheral) {
        self.peripherals.lock().unwrap_or_else(|e| e.into_inner()).insert(address, peripheral);
    }

    pub fn peripheral(&self, address: &Address) -> Option<FakePeripheral> {
        self.peripherals.lock().unwrap_or_else(|e| e.into_inner()).get(address).cloned()
    }
}

impl BackendProvider for FakeProvider {
    fn device(&self, address: &Address) -> Result<Arc<dyn NativeDevice>> {
        match self.peripheral(address) {
            Some(peripheral) => Ok(Arc::new(peripheral)),
            None => Err(anyhow!("No fake peripheral at {}", address).into()),
        }
    }
}
