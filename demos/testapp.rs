//! Registers two record families, allocates and frees a few of them and prints the
//! manager state along the way. Run with `RUST_LOG=debug` to see the page traffic.

use std::ptr::NonNull;

use slabmm::{MemoryManager, Result};

/// Size of the `emp_t` record: a 32 byte name plus an employee number.
const EMP_SIZE: usize = 36;

/// Size of the `student_t` record: a 32 byte name, a roll number and marks.
const STUDENT_SIZE: usize = 64;

fn log_alloc(family: &str, units: usize, ptr: NonNull<u8>) {
    println!("Requested {units} x {family}, received {ptr:p}");
}

fn main() -> Result<()> {
    env_logger::init();

    let mut manager = MemoryManager::new()?;
    manager.register_family("emp_t", EMP_SIZE)?;
    manager.register_family("student_t", STUDENT_SIZE)?;

    print!("{}", manager.list_families());

    let mut emps = Vec::new();
    for units in [1, 1, 3] {
        let ptr = manager.allocate("emp_t", units)?;
        log_alloc("emp_t", units, ptr);
        emps.push(ptr);
    }

    let student = manager.allocate("student_t", 2)?;
    log_alloc("student_t", 2, student);

    print!("{}", manager.dump_usage(None)?);

    manager.free(emps.remove(1))?;
    manager.free(student)?;

    print!("{}", manager.dump_usage(None)?);

    for ptr in emps {
        manager.free(ptr)?;
    }

    print!("{}", manager.dump_usage(Some("emp_t"))?);

    Ok(())
}
