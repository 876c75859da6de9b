use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{trace, Instrument};

use super::{StageError, Transform};

#[derive(Debug)]
enum Request {
    Encrypt(Vec<u8>),
    Decrypt(Vec<u8>),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Transformed {
    Encrypted(Vec<u8>),
    Decrypted(Vec<u8>),
}

/// A transform pipeline running on its own task.
///
/// Requests are queued on one channel and answered in submission order on another, so the
/// stream order of each direction is preserved. The handle counts requests that have not
/// been answered yet; a session must not close while output is still being produced.
pub struct StageHandle {
    requests: mpsc::UnboundedSender<Request>,
    responses: mpsc::UnboundedReceiver<Result<Transformed, StageError>>,
    encrypting: usize,
    decrypting: usize,
    task: JoinHandle<()>,
}

impl StageHandle {
    pub fn spawn<S>(mut stage: S) -> Self
    where
        S: Transform + Send + 'static,
    {
        let (requests, mut inbox) = mpsc::unbounded_channel::<Request>();
        let (outbox, responses) = mpsc::unbounded_channel();

        let task = tokio::spawn(
            async move {
                while let Some(request) = inbox.recv().await {
                    let response = match request {
                        Request::Encrypt(data) => stage.encrypt(data).map(Transformed::Encrypted),
                        Request::Decrypt(data) => stage.decrypt(data).map(Transformed::Decrypted),
                    };
                    let failed = response.is_err();
                    if outbox.send(response).is_err() || failed {
                        break;
                    }
                }
                trace!("stage worker finished");
            }
            .in_current_span(),
        );

        StageHandle {
            requests,
            responses,
            encrypting: 0,
            decrypting: 0,
            task,
        }
    }

    pub fn encrypt(&mut self, data: Vec<u8>) -> Result<(), StageError> {
        self.requests
            .send(Request::Encrypt(data))
            .map_err(|_| StageError::WorkerGone)?;
        self.encrypting += 1;
        Ok(())
    }

    pub fn decrypt(&mut self, data: Vec<u8>) -> Result<(), StageError> {
        self.requests
            .send(Request::Decrypt(data))
            .map_err(|_| StageError::WorkerGone)?;
        self.decrypting += 1;
        Ok(())
    }

    /// Next answer from the worker. Pends forever while nothing is in flight, which keeps
    /// it usable as a `select!` branch.
    pub async fn recv(&mut self) -> Result<Transformed, StageError> {
        if self.in_flight() == 0 {
            return std::future::pending().await;
        }

        let response = self
            .responses
            .recv()
            .await
            .unwrap_or(Err(StageError::WorkerGone));

        match &response {
            Ok(Transformed::Encrypted(_)) => self.encrypting -= 1,
            Ok(Transformed::Decrypted(_)) => self.decrypting -= 1,
            Err(_) => {
                self.encrypting = 0;
                self.decrypting = 0;
            }
        }
        response
    }

    pub fn encrypting(&self) -> usize {
        self.encrypting
    }

    pub fn decrypting(&self) -> usize {
        self.decrypting
    }

    pub fn in_flight(&self) -> usize {
        self.encrypting + self.decrypting
    }

    /// Stops the worker. Unanswered requests are discarded.
    pub fn shutdown(&mut self) {
        self.encrypting = 0;
        self.decrypting = 0;
        self.task.abort();
    }
}

impl Drop for StageHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::pipeline;

    #[tokio::test]
    async fn answers_in_submission_order() {
        let key: &[u8] = b"worker key";
        let mut tx = StageHandle::spawn(pipeline(Some(key), 9, true).unwrap().unwrap());
        let mut rx = StageHandle::spawn(pipeline(Some(key), 9, true).unwrap().unwrap());

        let blocks: Vec<Vec<u8>> = (0..50u8).map(|i| vec![i; i as usize + 1]).collect();
        for block in &blocks {
            tx.encrypt(block.clone()).unwrap();
        }
        assert_eq!(tx.encrypting(), blocks.len());

        for _ in 0..blocks.len() {
            let Transformed::Encrypted(wire) = tx.recv().await.unwrap() else {
                panic!("expected ciphertext");
            };
            rx.decrypt(wire).unwrap();
        }
        assert_eq!(tx.in_flight(), 0);

        let mut plain = Vec::new();
        while rx.in_flight() > 0 {
            let Transformed::Decrypted(bytes) = rx.recv().await.unwrap() else {
                panic!("expected plaintext");
            };
            plain.extend(bytes);
        }
        assert_eq!(plain, blocks.concat());
    }

    #[tokio::test]
    async fn failure_is_reported_and_stops_worker() {
        let mut rx = StageHandle::spawn(pipeline(None, 0, true).unwrap().unwrap());
        rx.decrypt(vec![4, 0, 4, 0, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
        assert!(rx.recv().await.is_err());
        assert_eq!(rx.in_flight(), 0);
    }
}
