// Copyright 2022 Ryan Seipp
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

//! Per-request resource pool
//!
//! Everything allocated for a request is owned by the request and lives until
//! finalize drops it. What remains of the classical arena is the part
//! ownership cannot express: cleanup callbacks that must fire in LIFO order
//! before the owned data goes away, and temp files that are unlinked with the
//! pool rather than with any single buffer that windows them.

use std::fs::File;
use std::rc::Rc;

use tempfile::NamedTempFile;

/// Cleanup registry attached to a request or connection. Callbacks run in
/// reverse registration order exactly once, either at [`Pool::destroy`] or
/// when the pool drops.
#[derive(Default)]
pub struct Pool {
    cleanups: Vec<Box<dyn FnOnce()>>,
    temp_files: Vec<NamedTempFile>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("cleanups", &self.cleanups.len())
            .field("temp_files", &self.temp_files.len())
            .finish()
    }
}

impl Pool {
    pub fn new() -> Self {
        Pool::default()
    }

    /// Register a cleanup to run when the pool is destroyed.
    pub fn add_cleanup(&mut self, cleanup: impl FnOnce() + 'static) {
        self.cleanups.push(Box::new(cleanup));
    }

    /// Take ownership of a temp file for the lifetime of the pool and hand
    /// back a shared read handle for file-range buffers. The file is unlinked
    /// when the pool is destroyed.
    pub fn hold_temp_file(&mut self, file: NamedTempFile) -> std::io::Result<Rc<File>> {
        let reader = Rc::new(file.reopen()?);
        self.temp_files.push(file);
        Ok(reader)
    }

    /// Number of registered cleanups.
    pub fn cleanup_count(&self) -> usize {
        self.cleanups.len()
    }

    /// Run all cleanups LIFO and release held resources.
    pub fn destroy(&mut self) {
        while let Some(cleanup) = self.cleanups.pop() {
            cleanup();
        }
        self.temp_files.clear();
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::io::Write;
    use std::rc::Rc;

    use super::Pool;

    #[test]
    fn cleanups_fire_in_lifo_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut pool = Pool::new();

        for i in 0..3 {
            let order = order.clone();
            pool.add_cleanup(move || order.borrow_mut().push(i));
        }
        pool.destroy();

        assert_eq!(vec![2, 1, 0], *order.borrow());
    }

    #[test]
    fn cleanups_fire_once_even_when_destroy_precedes_drop() {
        let count = Rc::new(RefCell::new(0));
        let mut pool = Pool::new();
        let counter = count.clone();
        pool.add_cleanup(move || *counter.borrow_mut() += 1);

        pool.destroy();
        drop(pool);

        assert_eq!(1, *count.borrow());
    }

    #[test]
    fn held_temp_file_readable_until_destroy() {
        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        tmp.write_all(b"spooled").expect("write");
        let path = tmp.path().to_path_buf();

        let mut pool = Pool::new();
        let reader = pool.hold_temp_file(tmp).expect("reopen");
        assert!(path.exists());

        drop(reader);
        pool.destroy();
        assert!(!path.exists());
    }
}
