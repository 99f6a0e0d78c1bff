//! An in-memory unit for exercising entities without a Modbus server.

use crate::connection::{self, RegisterAccess};
use crate::modbus::Operation;
use crate::registers::RegisterKind;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Mutex;

/// Exception code for reads of registers the fake does not know about.
const ILLEGAL_DATA_ADDRESS: u8 = 2;

#[derive(Default)]
pub struct FakeHub {
    registers: Mutex<HashMap<(RegisterKind, u16), u16>>,
    writes: Mutex<Vec<(u16, u16)>>,
}

impl FakeHub {
    pub fn with_holding(self, address: u16, value: u16) -> Self {
        self.set(RegisterKind::Holding, address, value);
        self
    }

    pub fn with_input(self, address: u16, value: u16) -> Self {
        self.set(RegisterKind::Input, address, value);
        self
    }

    pub fn set(&self, kind: RegisterKind, address: u16, value: u16) {
        self.registers.lock().unwrap().insert((kind, address), value);
    }

    /// Every write so far, as `(address, value)` in order.
    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.writes.lock().unwrap().clone()
    }
}

impl RegisterAccess for FakeHub {
    fn read(
        &self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> BoxFuture<'_, Result<Vec<u16>, connection::Error>> {
        let registers = self.registers.lock().unwrap();
        let result = (address..address + count)
            .map(|a| registers.get(&(kind, a)).copied())
            .collect::<Option<Vec<_>>>()
            .ok_or(connection::Error::Exception {
                code: ILLEGAL_DATA_ADDRESS,
                operation: Operation::read(kind, address, count),
            });
        Box::pin(async move { result })
    }

    fn write(&self, address: u16, value: u16) -> BoxFuture<'_, Result<(), connection::Error>> {
        self.writes.lock().unwrap().push((address, value));
        self.set(RegisterKind::Holding, address, value);
        Box::pin(async { Ok(()) })
    }
}
