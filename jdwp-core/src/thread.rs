// ThreadReference command implementations
//
// Thread names, plus the VM-wide thread list and suspend/resume.

use crate::commands::{command_sets, thread_commands, vm_commands};
use crate::protocol::JdwpResult;
use crate::session::Session;
use crate::types::ThreadId;

impl Session {
    /// Get a thread's name (ThreadReference.Name)
    pub async fn get_thread_name(&self, thread: ThreadId) -> JdwpResult<String> {
        self.send_command(command_sets::THREAD_REFERENCE, thread_commands::NAME, &thread)
            .await
    }

    /// Get all threads (VirtualMachine.AllThreads)
    pub async fn get_all_threads(&self) -> JdwpResult<Vec<ThreadId>> {
        self.send_command(command_sets::VIRTUAL_MACHINE, vm_commands::ALL_THREADS, &())
            .await
    }

    /// Suspend all threads (VirtualMachine.Suspend)
    pub async fn suspend_all(&self) -> JdwpResult<()> {
        self.exec(command_sets::VIRTUAL_MACHINE, vm_commands::SUSPEND, &())
            .await
    }

    /// Resume all threads (VirtualMachine.Resume)
    pub async fn resume_all(&self) -> JdwpResult<()> {
        self.exec(command_sets::VIRTUAL_MACHINE, vm_commands::RESUME, &())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_exact, encode_to_vec};
    use crate::testing::FakeTarget;
    use crate::types::IdSizes;

    #[tokio::test]
    async fn test_thread_name_uses_negotiated_object_width() {
        let target = FakeTarget::builder()
            .id_sizes(IdSizes::uniform(4))
            .respond(command_sets::THREAD_REFERENCE, thread_commands::NAME, |req, sizes| {
                assert_eq!(req.len(), 4);
                let thread: ThreadId = decode_exact(req, sizes)?;
                encode_to_vec(&format!("worker-{}", thread.0), sizes)
            })
            .spawn();
        let session = target.attach().await.unwrap();

        assert_eq!(session.get_thread_name(ThreadId(3)).await.unwrap(), "worker-3");
    }

    #[tokio::test]
    async fn test_all_threads() {
        let target = FakeTarget::builder()
            .respond(command_sets::VIRTUAL_MACHINE, vm_commands::ALL_THREADS, |_, sizes| {
                encode_to_vec(&vec![ThreadId(1), ThreadId(2)], sizes)
            })
            .spawn();
        let session = target.attach().await.unwrap();

        assert_eq!(
            session.get_all_threads().await.unwrap(),
            vec![ThreadId(1), ThreadId(2)]
        );
    }
}
