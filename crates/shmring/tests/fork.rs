//! Cross-process behaviour: queues and buffers shared over `fork`.

use std::time::Duration;

use shmring::{SharedBuffer, SharedQueue};

/// Fork a child running `f`; the child never returns to the test harness.
fn fork_child<F: FnOnce()>(f: F) -> libc::pid_t {
    let _ = env_logger::builder().is_test(true).try_init();
    // SAFETY: the child only touches fork-inherited queue handles and
    // libc calls, then exits without unwinding into the parent's state.
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
        unsafe { libc::_exit(if outcome.is_ok() { 0 } else { 101 }) };
    }
    pid
}

fn wait_for(pid: libc::pid_t) {
    let mut status = 0;
    // SAFETY: pid is a child of this process.
    let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(rc, pid);
    assert!(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0, "child failed");
}

#[test]
fn queue_crosses_process_boundary() {
    let requests = SharedQueue::new(64, 8).unwrap();
    let replies = SharedQueue::new(64, 8).unwrap();

    let pid = fork_child(|| {
        loop {
            let msg = {
                let slot = requests.get_direct(true, Some(Duration::from_secs(10))).unwrap();
                slot.bytes().to_vec()
            };
            if msg == b"quit" {
                break;
            }
            let mut reply = msg;
            reply.reverse();
            replies.put(&reply, true, None).unwrap();
        }
    });

    requests.put(b"abc", true, None).unwrap();
    requests.put(b"12345", true, None).unwrap();
    assert_eq!(
        replies.get_direct(true, Some(Duration::from_secs(10))).unwrap().bytes(),
        b"cba"
    );
    assert_eq!(
        replies.get_direct(true, Some(Duration::from_secs(10))).unwrap().bytes(),
        b"54321"
    );

    requests.put(b"quit", true, None).unwrap();
    wait_for(pid);
}

#[test]
fn named_buffer_attaches_from_child() {
    let buf = SharedBuffer::create(32).unwrap();
    buf.get_direct().unwrap().as_mut_slice()[..5].copy_from_slice(b"ready");

    let done = SharedQueue::new(16, 2).unwrap();
    let name = buf.name().to_owned();

    let pid = fork_child(|| {
        let attached = SharedBuffer::open(&name, 32).unwrap();
        let seen = {
            let guard = attached.get_direct().unwrap();
            guard.as_slice()[..5].to_vec()
        };
        done.put(&seen, true, None).unwrap();
        // Wait for the master to unlink, then report the flag flip.
        while !attached.is_unlinked() {
            std::thread::sleep(Duration::from_millis(5));
        }
        done.put(b"unlinked", true, None).unwrap();
    });

    assert_eq!(
        done.get_direct(true, Some(Duration::from_secs(10))).unwrap().bytes(),
        b"ready"
    );
    buf.close();
    assert_eq!(
        done.get_direct(true, Some(Duration::from_secs(10))).unwrap().bytes(),
        b"unlinked"
    );
    wait_for(pid);
}
