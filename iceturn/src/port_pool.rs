//! Relay port pool
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use rand::Rng;
use std::collections::{HashSet, VecDeque};

/// FIFO free list over a port range
///
/// Released ports go to the back of the queue, so a port is handed out
/// again only after every other free port has been.
#[derive(Debug)]
pub struct PortPool {
    free: VecDeque<u16>,
    in_use: HashSet<u16>,
}

impl PortPool {
    /// Pool over `min..=max`, starting at a random offset in the range
    pub fn new(min: u16, max: u16) -> Self {
        let mut free: VecDeque<u16> = (min..=max).collect();
        if !free.is_empty() {
            let offset = rand::thread_rng().gen_range(0..free.len());
            free.rotate_left(offset);
        }
        PortPool {
            free,
            in_use: HashSet::new(),
        }
    }

    /// Next free port, if any
    pub fn acquire(&mut self) -> Option<u16> {
        let port = self.free.pop_front()?;
        self.in_use.insert(port);
        Some(port)
    }

    /// Return a port; ports not handed out by this pool are ignored
    pub fn release(&mut self, port: u16) -> bool {
        if self.in_use.remove(&port) {
            self.free.push_back(port);
            true
        } else {
            false
        }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }
}
