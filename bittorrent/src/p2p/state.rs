#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Handshaking,
    Introducing, // Where peers tell each other what pieces they have.
    Connected,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionState {

    pub conn_state: ConnState,

    // Whether we are answering the peer's requests.
    pub am_choking: bool,

    // Whether we want pieces the peer has.
    pub am_interested: bool,

    // Whether the peer is answering our requests.
    pub peer_choking: bool,

    // Whether the peer is interested in our pieces.
    pub peer_interested: bool,

}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            conn_state: ConnState::Disconnected,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}
