//! Forward-only cursor over Search responses.

use std::sync::Arc;

use crate::future::SearchFuture;
use crate::protocol::{Message, Response};
use crate::result::{LdapError, LdapResult, Result};
use crate::search::{BinaryAttributeDetector, SearchEntry};
use crate::RequestId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CursorState {
    NotStarted,
    HasCurrent,
    Exhausted,
    Closed,
    Failed,
}

/// Forward-only cursor over the responses to a Search.
///
/// Responses are retrieved lazily: each call to [`next()`](#method.next) waits
/// for the next response, bounded by the operation timeout. Entries, referrals
/// and intermediate responses are all positions of the cursor; the
/// SearchResultDone ends the iteration, and its result is available through
/// [`result()`](#method.result).
///
/// If waiting for a response fails, the cursor closes itself, abandoning the
/// search, and reports the failure as `CursorBroken`. Closing or dropping a
/// cursor before the end of the stream also abandons the search.
///
/// For iteration over the entries, turn the cursor into an
/// [`EntryIter`](struct.EntryIter.html) with [`entries()`](#method.entries) or
/// `into_iter()`.
#[derive(Debug)]
pub struct SearchCursor {
    future: SearchFuture,
    detector: Arc<dyn BinaryAttributeDetector>,
    state: CursorState,
    current: Option<Message>,
    done: Option<LdapResult>,
}

impl SearchCursor {
    pub(crate) fn new(future: SearchFuture, detector: Arc<dyn BinaryAttributeDetector>) -> Self {
        SearchCursor {
            future,
            detector,
            state: CursorState::NotStarted,
            current: None,
            done: None,
        }
    }

    /// Message ID of the Search operation.
    pub fn message_id(&self) -> RequestId {
        self.future.message_id()
    }

    /// Advance to the next response. Returns `true` if the cursor is positioned
    /// on a new entry, referral or intermediate response, `false` if the stream
    /// has ended or the cursor is closed.
    pub fn next(&mut self) -> Result<bool> {
        match self.state {
            CursorState::Exhausted | CursorState::Closed | CursorState::Failed => return Ok(false),
            CursorState::NotStarted | CursorState::HasCurrent => (),
        }
        self.current = None;
        let msg = match self.future.next_response() {
            Ok(msg) => msg,
            Err(e) => return Err(self.fail(e)),
        };
        match msg.response {
            Response::Entry(_) | Response::Reference(_) | Response::Intermediate { .. } => {
                self.current = Some(msg);
                self.state = CursorState::HasCurrent;
                Ok(true)
            }
            Response::Done(result) => {
                debug!("search {} done: {}", self.message_id(), result);
                self.done = Some(result);
                self.state = CursorState::Exhausted;
                Ok(false)
            }
            _ => {
                let e = LdapError::Decoding(format!(
                    "unexpected {:?} response in search {}",
                    msg.kind(),
                    msg.id
                ));
                Err(self.fail(e))
            }
        }
    }

    fn fail(&mut self, cause: LdapError) -> LdapError {
        warn!("search {} failed: {}", self.message_id(), cause);
        self.future.cancel(true);
        self.current = None;
        self.state = CursorState::Failed;
        LdapError::CursorBroken {
            source: Box::new(cause),
        }
    }

    /// Parse the current entry.
    ///
    /// Fails with `InvalidPosition` unless positioned on a response, with
    /// `Referral` if positioned on a referral, and with `NotAnEntry` on an
    /// intermediate response.
    pub fn get(&self) -> Result<SearchEntry> {
        match self.current {
            Some(Message {
                response: Response::Entry(ref re),
                ..
            }) => SearchEntry::construct_with(re.clone(), self.detector.as_ref()),
            Some(Message {
                response: Response::Reference(ref urls),
                ..
            }) => Err(LdapError::Referral { urls: urls.clone() }),
            Some(_) => Err(LdapError::NotAnEntry),
            None => Err(LdapError::InvalidPosition),
        }
    }

    /// True if the cursor holds a current response. Never blocks.
    pub fn available(&self) -> bool {
        self.state == CursorState::HasCurrent
    }

    pub fn is_entry(&self) -> bool {
        matches!(self.current_response(), Some(Response::Entry(_)))
    }

    pub fn is_referral(&self) -> bool {
        matches!(self.current_response(), Some(Response::Reference(_)))
    }

    pub fn is_intermediate(&self) -> bool {
        matches!(self.current_response(), Some(Response::Intermediate { .. }))
    }

    fn current_response(&self) -> Option<&Response> {
        self.current.as_ref().map(|msg| &msg.response)
    }

    /// Current response message, with its controls.
    pub fn current(&self) -> Option<&Message> {
        self.current.as_ref()
    }

    /// URLs of the current referral.
    pub fn referral(&self) -> Result<Vec<String>> {
        match self.current_response() {
            Some(Response::Reference(urls)) => Ok(urls.clone()),
            _ => Err(LdapError::InvalidPosition),
        }
    }

    /// Name and value of the current intermediate response.
    pub fn intermediate(&self) -> Result<(Option<String>, Option<Vec<u8>>)> {
        match self.current_response() {
            Some(Response::Intermediate { name, value }) => Ok((name.clone(), value.clone())),
            _ => Err(LdapError::InvalidPosition),
        }
    }

    /// Result of the SearchResultDone, once the stream is exhausted.
    pub fn result(&self) -> Option<&LdapResult> {
        self.done.as_ref()
    }

    /// Close the cursor. If the stream isn't exhausted, the search is
    /// abandoned. Closing a closed cursor does nothing.
    pub fn close(&mut self) {
        match self.state {
            CursorState::Closed => return,
            CursorState::NotStarted | CursorState::HasCurrent => {
                if self.future.cancel(true) {
                    debug!("search {} abandoned", self.message_id());
                }
            }
            CursorState::Exhausted | CursorState::Failed => (),
        }
        self.current = None;
        self.state = CursorState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == CursorState::Closed
    }

    pub fn before_first(&mut self) -> Result<()> {
        Err(LdapError::UnsupportedOperation("before_first"))
    }

    pub fn after_last(&mut self) -> Result<()> {
        Err(LdapError::UnsupportedOperation("after_last"))
    }

    pub fn first(&mut self) -> Result<bool> {
        Err(LdapError::UnsupportedOperation("first"))
    }

    pub fn last(&mut self) -> Result<bool> {
        Err(LdapError::UnsupportedOperation("last"))
    }

    pub fn previous(&mut self) -> Result<bool> {
        Err(LdapError::UnsupportedOperation("previous"))
    }

    pub fn before(&mut self, _entry: &SearchEntry) -> Result<()> {
        Err(LdapError::UnsupportedOperation("before"))
    }

    pub fn after(&mut self, _entry: &SearchEntry) -> Result<()> {
        Err(LdapError::UnsupportedOperation("after"))
    }

    /// Consume the cursor, iterating over the entries.
    pub fn entries(self) -> EntryIter {
        EntryIter {
            cursor: self,
            done_reported: false,
        }
    }
}

/// Iterator over the entries of a Search, created by
/// [`SearchCursor::entries()`](struct.SearchCursor.html#method.entries).
///
/// Referrals are returned as `Referral` errors, intermediate responses are
/// skipped, and an unsuccessful SearchResultDone becomes the last item.
#[derive(Debug)]
pub struct EntryIter {
    cursor: SearchCursor,
    done_reported: bool,
}

impl EntryIter {
    /// The underlying cursor, for access to the final result.
    pub fn cursor(&self) -> &SearchCursor {
        &self.cursor
    }
}

impl Iterator for EntryIter {
    type Item = Result<SearchEntry>;

    fn next(&mut self) -> Option<Result<SearchEntry>> {
        loop {
            match self.cursor.next() {
                Err(e) => return Some(Err(e)),
                Ok(false) => {
                    if self.done_reported {
                        return None;
                    }
                    self.done_reported = true;
                    return match self.cursor.done.clone().map(LdapResult::non_error) {
                        Some(Err(e)) => Some(Err(e)),
                        _ => None,
                    };
                }
                Ok(true) if self.cursor.is_intermediate() => continue,
                Ok(true) => return Some(self.cursor.get()),
            }
        }
    }
}

impl IntoIterator for SearchCursor {
    type Item = Result<SearchEntry>;
    type IntoIter = EntryIter;

    fn into_iter(self) -> EntryIter {
        self.entries()
    }
}

impl Drop for SearchCursor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::future::SearchSink;
    use crate::ldap::OpSender;
    use crate::protocol::{LdapOp, OpRequest};
    use crate::search::{DefaultBinaryAttributeDetector, ResultEntry};
    use crate::test_support::search_entry;

    use ldap3::asn1::ASNTag;
    use tokio::sync::mpsc;

    fn cursor(timeout: Option<Duration>) -> (SearchCursor, SearchSink, mpsc::UnboundedReceiver<OpRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (future, sink) = SearchFuture::pair(5, timeout, Some(OpSender::new(tx)));
        let cursor = SearchCursor::new(future, Arc::new(DefaultBinaryAttributeDetector::new()));
        (cursor, sink, rx)
    }

    fn msg(response: Response) -> Message {
        Message {
            id: 5,
            response,
            controls: vec![],
        }
    }

    fn entry(cn: &str) -> Message {
        let dn = format!("cn={},dc=example,dc=org", cn);
        let tag = search_entry(&dn, &[("cn", &[cn.as_bytes()])]).into_structure();
        msg(Response::Entry(ResultEntry::new(tag)))
    }

    fn done(rc: u32) -> Message {
        msg(Response::Done(LdapResult {
            rc,
            ..Default::default()
        }))
    }

    fn reference(url: &str) -> Message {
        msg(Response::Reference(vec![String::from(url)]))
    }

    fn abandoned(rx: &mut mpsc::UnboundedReceiver<OpRequest>) -> bool {
        matches!(rx.try_recv(), Ok((_, LdapOp::Abandon(5), _, _)))
    }

    #[test]
    fn two_entries_then_done() {
        let (mut cursor, mut sink, mut rx) = cursor(None);
        sink.push(entry("a"));
        sink.push(entry("b"));
        sink.push(done(0));
        assert!(!cursor.available());
        assert!(cursor.next().unwrap());
        assert!(cursor.is_entry());
        assert_eq!(cursor.get().unwrap().dn, "cn=a,dc=example,dc=org");
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.get().unwrap().attrs["cn"], vec!["b"]);
        assert!(!cursor.next().unwrap());
        assert_eq!(cursor.result().unwrap().rc, 0);
        assert!(!cursor.next().unwrap());
        drop(cursor);
        assert!(!abandoned(&mut rx));
    }

    #[test]
    fn referral_then_done() {
        let (mut cursor, mut sink, _rx) = cursor(None);
        sink.push(reference("ldap://other.example.org/dc=example,dc=org"));
        sink.push(done(0));
        assert!(cursor.next().unwrap());
        assert!(cursor.is_referral());
        match cursor.get() {
            Err(LdapError::Referral { urls }) => {
                assert_eq!(urls, vec!["ldap://other.example.org/dc=example,dc=org"])
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(cursor.referral().unwrap().len(), 1);
        assert!(!cursor.next().unwrap());
    }

    #[test]
    fn get_outside_of_stream_is_invalid_position() {
        let (mut cursor, mut sink, _rx) = cursor(None);
        assert!(matches!(cursor.get(), Err(LdapError::InvalidPosition)));
        sink.push(done(0));
        assert!(!cursor.next().unwrap());
        assert!(matches!(cursor.get(), Err(LdapError::InvalidPosition)));
    }

    #[test]
    fn intermediate_response_is_a_position() {
        let (mut cursor, mut sink, _rx) = cursor(None);
        sink.push(msg(Response::Intermediate {
            name: Some(String::from("1.3.6.1.4.1.4203.1.9.1.4")),
            value: None,
        }));
        sink.push(done(0));
        assert!(cursor.next().unwrap());
        assert!(cursor.is_intermediate());
        assert!(matches!(cursor.get(), Err(LdapError::NotAnEntry)));
        let (name, value) = cursor.intermediate().unwrap();
        assert_eq!(name.as_deref(), Some("1.3.6.1.4.1.4203.1.9.1.4"));
        assert_eq!(value, None);
    }

    #[test]
    fn timeout_breaks_and_closes_cursor() {
        let (mut cursor, mut sink, mut rx) = cursor(Some(Duration::from_millis(50)));
        sink.push(entry("a"));
        assert!(cursor.next().unwrap());
        let start = Instant::now();
        let err = cursor.next().unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(matches!(err, LdapError::CursorBroken { .. }));
        assert!(err.is_timeout());
        assert!(abandoned(&mut rx));
        assert!(!cursor.next().unwrap());
        assert!(matches!(cursor.get(), Err(LdapError::InvalidPosition)));
        assert!(!sink.push(entry("b")));
    }

    #[test]
    fn early_close_abandons_once() {
        let (mut cursor, mut sink, mut rx) = cursor(None);
        sink.push(entry("a"));
        assert!(cursor.next().unwrap());
        cursor.close();
        assert!(cursor.is_closed());
        assert!(abandoned(&mut rx));
        cursor.close();
        drop(cursor);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropping_unfinished_cursor_abandons() {
        let (cursor, _sink, mut rx) = cursor(None);
        drop(cursor);
        assert!(abandoned(&mut rx));
    }

    #[test]
    fn positional_operations_are_unsupported() {
        let (mut cursor, _sink, _rx) = cursor(None);
        match cursor.previous() {
            Err(LdapError::UnsupportedOperation(op)) => assert_eq!(op, "previous"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(cursor.before_first().is_err());
        assert!(cursor.after_last().is_err());
        assert!(cursor.first().is_err());
    }

    #[test]
    fn last_is_unsupported_and_leaves_stream_alone() {
        let (mut cursor, mut sink, _rx) = cursor(None);
        sink.push(entry("a"));
        sink.push(entry("b"));
        sink.push(done(0));
        match cursor.last() {
            Err(LdapError::UnsupportedOperation(op)) => assert_eq!(op, "last"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.get().unwrap().dn, "cn=a,dc=example,dc=org");
    }

    #[test]
    fn iterator_yields_entries_referrals_and_failed_result() {
        let (cursor, mut sink, _rx) = cursor(None);
        sink.push(entry("a"));
        sink.push(msg(Response::Intermediate {
            name: None,
            value: None,
        }));
        sink.push(reference("ldap://other.example.org/"));
        sink.push(entry("b"));
        sink.push(done(4));
        let items: Vec<_> = cursor.entries().collect();
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].as_ref().unwrap().dn, "cn=a,dc=example,dc=org");
        assert!(matches!(items[1], Err(LdapError::Referral { .. })));
        assert!(items[2].is_ok());
        match items[3] {
            Err(LdapError::LdapResult { ref result }) => assert_eq!(result.rc, 4),
            ref other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
