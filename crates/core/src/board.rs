//! Board client: filesystem and execution operations on a connected board
//!
//! Each operation builds its command with [`CommandBuilder`], runs it through
//! the [`TransportSession`] and decodes the payload with [`ResponseDecoder`].

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::protocol::{CommandBuilder, RawResponse, ResponseDecoder};
use crate::session::TransportSession;
use crate::types::{DeviceInfo, MicroFile, MicroScript};

/// High-level operations for host applications
#[derive(Clone)]
pub struct BoardClient {
    session: Arc<TransportSession>,
}

impl BoardClient {
    pub fn new(session: Arc<TransportSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<TransportSession> {
        &self.session
    }

    // ===== Filesystem =====

    /// List `path`, directories first
    pub async fn list_dir(&self, path: &str) -> Result<Vec<MicroFile>> {
        let timeout = self.session.config().read_timeout;
        let payload = self
            .session
            .send_synchronous(&CommandBuilder::list_directory(path), timeout)
            .await?;
        let files = ResponseDecoder::decode_directory_listing(&payload, path);
        debug!("Listed {} ({} entries)", path, files.len());
        Ok(files)
    }

    /// Whole content of a file, `\r\n` normalized to `\n`
    ///
    /// A file the board could not read is an error, never empty content.
    pub async fn read_file(&self, path: &str) -> Result<String> {
        let timeout = self.session.config().read_timeout;
        let payload = self
            .session
            .send_synchronous(&CommandBuilder::read_file(path), timeout)
            .await?;
        let content = ResponseDecoder::decode_file_content(&payload).map_err(|e| {
            warn!("Reading {} failed: {}", path, e);
            e
        })?;
        debug!("Read {} ({} bytes)", path, content.len());
        Ok(content)
    }

    /// Overwrite a file, returning the byte count the board reports
    pub async fn write_file(&self, path: &str, content: &str) -> Result<usize> {
        let timeout = self.session.config().write_timeout;
        let payload = self
            .session
            .send_synchronous(&CommandBuilder::write_file(path, content), timeout)
            .await?;
        let written = payload.parse::<usize>().map_err(|_| {
            CoreError::MalformedResponse(format!("write of {} reported {:?}", path, payload))
        })?;
        info!("Wrote {} bytes to {}", written, path);
        Ok(written)
    }

    pub async fn remove_file(&self, file: &MicroFile) -> Result<Vec<MicroFile>> {
        self.mutate(CommandBuilder::remove_file(file), file.parent_path()).await
    }

    pub async fn remove_dir(&self, dir: &MicroFile) -> Result<Vec<MicroFile>> {
        self.mutate(CommandBuilder::remove_directory(dir), dir.parent_path()).await
    }

    pub async fn make_dir(&self, dir: &MicroFile) -> Result<Vec<MicroFile>> {
        self.mutate(CommandBuilder::make_directory(dir), dir.parent_path()).await
    }

    pub async fn make_file(&self, file: &MicroFile) -> Result<Vec<MicroFile>> {
        self.mutate(CommandBuilder::make_file(file), file.parent_path()).await
    }

    /// Move `src` to `dst`, returning the listing of `dst`'s directory
    pub async fn rename(&self, src: &MicroFile, dst: &MicroFile) -> Result<Vec<MicroFile>> {
        self.mutate(CommandBuilder::rename(src, dst), dst.parent_path()).await
    }

    /// Run a mutation that prints the parent listing afterwards
    ///
    /// A failed mutation raises before printing; the parent is then listed
    /// on its own so the caller still sees the unchanged state.
    async fn mutate(&self, command: String, parent: String) -> Result<Vec<MicroFile>> {
        let timeout = self.session.config().write_timeout;
        let payload = self.session.send_synchronous(&command, timeout).await?;
        if payload.is_empty() {
            warn!("Operation in {} failed on the board, listing it again", parent);
            return self.list_dir(&parent).await;
        }
        Ok(ResponseDecoder::decode_directory_listing(&payload, &parent))
    }

    // ===== Execution =====

    /// Submit code to the REPL; output streams to the terminal
    ///
    /// Multi-line code goes through paste mode so indentation survives.
    pub async fn execute(&self, code: &str) -> Result<()> {
        if code.contains('\n') {
            debug!("Pasting {} lines", code.lines().count());
            self.session.send_bytes(&CommandBuilder::paste_block(code)).await
        } else {
            self.session.send_fire_and_forget(code).await
        }
    }

    /// Submit a single interactive line
    pub async fn eval(&self, line: &str) -> Result<()> {
        self.session.send_fire_and_forget(line).await
    }

    /// Run a script stored on the board
    pub async fn run_file(&self, path: &str) -> Result<()> {
        info!("Running {}", path);
        self.session.send_fire_and_forget(&CommandBuilder::run_file(path)).await
    }

    /// Run code through the raw REPL and capture its output
    pub async fn execute_raw(&self, code: &str) -> Result<RawResponse> {
        let timeout = self.session.config().read_timeout;
        self.session.execute_raw(code, timeout).await
    }

    pub async fn terminate_execution(&self) -> Result<()> {
        self.session.terminate_execution().await
    }

    pub async fn soft_reset(&self) -> Result<()> {
        self.session.soft_reset().await
    }

    /// Hard reset using the connected runtime's reset call
    pub async fn reset(&self) -> Result<()> {
        let device = self.device()?;
        info!("Hard reset of {} ({})", device.port, device.runtime_name());
        self.session
            .send_fire_and_forget(&CommandBuilder::hard_reset(device.is_micropython))
            .await
    }

    // ===== Scripts =====

    /// Open a board-side script for editing
    pub async fn load_script(&self, path: &str) -> Result<MicroScript> {
        let device = self.device()?;
        let content = self.read_file(path).await?;
        Ok(MicroScript::remote(path, content, device.is_micropython))
    }

    /// Persist a board-side script
    ///
    /// Local scripts belong to the host filesystem and are rejected.
    pub async fn save_script(&self, script: &MicroScript) -> Result<usize> {
        if !script.is_remote() {
            return Err(CoreError::NotSupported(format!(
                "{} is a local script",
                script.name()
            )));
        }
        self.write_file(&script.path, script.text()).await
    }

    fn device(&self) -> Result<DeviceInfo> {
        self.session.device().ok_or(CoreError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::session::SessionConfig;
    use crate::transport::MockTransport;
    use crate::types::FileType;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    async fn connected_board(micro_python: bool) -> (BoardClient, MockTransport, mpsc::Receiver<Bytes>) {
        let transport = MockTransport::new();
        let (session, rx) = TransportSession::new(Box::new(transport.clone()), SessionConfig::default());
        let session = Arc::new(session);
        session
            .open(DeviceInfo::new("/dev/ttyACM0", "Feather", micro_python))
            .await
            .unwrap();
        (BoardClient::new(session), transport, rx)
    }

    /// Wait for the `n`th write to be in flight, then answer it
    async fn respond(board: &BoardClient, transport: &MockTransport, n: usize, output: &str) {
        while transport.write_count() < n || !board.session().is_busy() {
            tokio::task::yield_now().await;
        }
        board.session().on_bytes_received(output.as_bytes());
    }

    async fn last_command_when_busy(board: &BoardClient, transport: &MockTransport) -> String {
        while transport.write_count() == 0 || !board.session().is_busy() {
            tokio::task::yield_now().await;
        }
        last_command(transport)
    }

    /// What the board prints for exchange `generation`
    fn reply(payload: &str, generation: u64) -> String {
        format!("@{{ {} }}@ EXEC DONE {}\r\n", payload, generation)
    }

    /// Read payload for `content`: byte count and hex dump
    fn file_payload(content: &str) -> String {
        let hex: String = content.bytes().map(|b| format!("{:02x}", b)).collect();
        format!("{} {}", content.len(), hex)
    }

    fn last_command(transport: &MockTransport) -> String {
        String::from_utf8_lossy(transport.writes().last().unwrap()).into_owned()
    }

    #[tokio::test]
    async fn test_list_dir() {
        let (board, transport, _rx) = connected_board(true).await;
        let client = board.clone();
        let handle = tokio::spawn(async move { client.list_dir("/lib").await });

        respond(&board, &transport, 1, &reply("[('b.py', 32768, 0, 3), ('sub', 16384, 0, 0)]", 1)).await;
        let files = handle.await.unwrap().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].file_type, FileType::Directory);
        assert_eq!(files[1].full_path(), "/lib/b.py");
        assert!(last_command(&transport).contains("os.listdir(_p)"));
    }

    #[tokio::test]
    async fn test_read_file() {
        let (board, transport, _rx) = connected_board(true).await;
        let client = board.clone();
        let handle = tokio::spawn(async move { client.read_file("/main.py").await });

        respond(&board, &transport, 1, &reply(&file_payload("print('hi')\r\nx = 1\n"), 1)).await;
        assert_eq!(handle.await.unwrap().unwrap(), "print('hi')\nx = 1\n");
        assert!(last_command(&transport).contains("open('/main.py','rb')"));
    }

    #[tokio::test]
    async fn test_read_file_with_sentinel_text() {
        let (board, transport, _rx) = connected_board(true).await;
        let client = board.clone();
        let handle = tokio::spawn(async move { client.read_file("/a.py").await });

        let content = "print('EXEC DONE')\nd = {'k': '@{'}  # }@\n";
        respond(&board, &transport, 1, &reply(&file_payload(content), 1)).await;
        assert_eq!(handle.await.unwrap().unwrap(), content);
    }

    #[tokio::test]
    async fn test_unreadable_file_is_an_error() {
        let (board, transport, _rx) = connected_board(true).await;
        let client = board.clone();
        let handle = tokio::spawn(async move { client.read_file("/missing.py").await });

        respond(&board, &transport, 1, "Traceback (most recent call last):\r\nOSError: [Errno 2] ENOENT\r\n>>> ").await;
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn test_read_empty_file() {
        let (board, transport, _rx) = connected_board(true).await;
        let client = board.clone();
        let handle = tokio::spawn(async move { client.read_file("/empty.py").await });

        respond(&board, &transport, 1, &reply("0 ", 1)).await;
        assert_eq!(handle.await.unwrap().unwrap(), "");
    }

    #[tokio::test]
    async fn test_write_file_reports_count() {
        let (board, transport, _rx) = connected_board(true).await;
        let client = board.clone();
        let handle = tokio::spawn(async move { client.write_file("/a.py", "x = 'q'\n").await });

        respond(&board, &transport, 1, &reply("8", 1)).await;
        assert_eq!(handle.await.unwrap().unwrap(), 8);
        assert!(last_command(&transport).contains(r"'x = \'q\'\n'"));
    }

    #[tokio::test]
    async fn test_write_file_with_sentinel_text_survives_echo() {
        let (board, transport, _rx) = connected_board(true).await;
        let client = board.clone();
        let handle = tokio::spawn(async move { client.write_file("/a.py", "print('EXEC DONE')\n").await });

        // the REPL echoes the command line before running it
        let echo = last_command_when_busy(&board, &transport).await;
        board.session().on_bytes_received(echo.trim_matches('\r').as_bytes());
        board.session().on_bytes_received(b"\r\n");
        assert!(board.session().is_busy());

        board.session().on_bytes_received(reply("19", 1).as_bytes());
        assert_eq!(handle.await.unwrap().unwrap(), 19);
    }

    #[tokio::test]
    async fn test_write_file_failure_is_malformed() {
        let (board, transport, _rx) = connected_board(true).await;
        let client = board.clone();
        let handle = tokio::spawn(async move { client.write_file("/ro/a.py", "x").await });

        respond(&board, &transport, 1, "Traceback (most recent call last):\r\nOSError: 30\r\n>>> ").await;
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn test_failed_mutation_lists_parent_again() {
        let (board, transport, _rx) = connected_board(true).await;
        let client = board.clone();
        let target = MicroFile::new("missing.py", "/", FileType::File, 0);
        let handle = tokio::spawn(async move { client.remove_file(&target).await });

        respond(&board, &transport, 1, "Traceback (most recent call last):\r\nOSError: [Errno 2] ENOENT\r\n>>> ").await;
        respond(&board, &transport, 2, &reply("[('main.py', 32768, 0, 10)]", 2)).await;

        let files = handle.await.unwrap().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "main.py");
        assert_eq!(transport.write_count(), 2);
    }

    #[tokio::test]
    async fn test_make_dir_returns_new_listing() {
        let (board, transport, _rx) = connected_board(true).await;
        let client = board.clone();
        let dir = MicroFile::new("lib", "/", FileType::Directory, 0);
        let handle = tokio::spawn(async move { client.make_dir(&dir).await });

        respond(&board, &transport, 1, &reply("[('lib', 16384, 0, 0)]", 1)).await;
        let files = handle.await.unwrap().unwrap();
        assert!(files[0].is_dir());
        assert!(last_command(&transport).contains("os.mkdir('/lib')"));
    }

    #[tokio::test]
    async fn test_execute_uses_paste_mode_for_blocks() {
        let (board, transport, _rx) = connected_board(true).await;
        board.execute("print(1)").await.unwrap();
        assert_eq!(transport.writes()[0], b"\rprint(1)\r".to_vec());

        board.execute("for i in range(2):\n    print(i)").await.unwrap();
        let block = &transport.writes()[1];
        assert_eq!(block.first(), Some(&0x05));
        assert_eq!(block.last(), Some(&0x04));
    }

    #[tokio::test]
    async fn test_reset_follows_runtime() {
        let (board, transport, _rx) = connected_board(false).await;
        board.reset().await.unwrap();
        assert!(last_command(&transport).contains("microcontroller.reset()"));
    }

    #[tokio::test]
    async fn test_save_local_script_not_supported() {
        let (board, transport, _rx) = connected_board(true).await;
        let script = MicroScript::local("/home/me/blink.py", "pass", true);
        let err = board.save_script(&script).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        assert_eq!(transport.write_count(), 0);
    }

    #[tokio::test]
    async fn test_load_script_is_remote() {
        let (board, transport, _rx) = connected_board(false).await;
        let client = board.clone();
        let handle = tokio::spawn(async move { client.load_script("/code.py").await });

        respond(&board, &transport, 1, &reply(&file_payload("import board"), 1)).await;
        let script = handle.await.unwrap().unwrap();
        assert!(script.is_remote());
        assert!(!script.micro_python);
        assert_eq!(script.text(), "import board");
    }
}
