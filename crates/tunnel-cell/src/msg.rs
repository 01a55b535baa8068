//! Typed messages carried in cell bodies.
//!
//! A [`CellMsg`] is what a cell body means once any onion layers have
//! been removed.  Link-level kinds (CREATE, CREATED, DESTROY) are never
//! encrypted, so every hop can parse them; all others are parsed only by
//! the hop that terminates the circuit.

use std::fmt;
use std::net::SocketAddr;

use crate::cell::CellKind;
use crate::datamsg::DataMsg;
use caret::caret_int;
use tunnel_bytes::{Error, Readable, Reader, Result, Writeable, Writer};
use tunnel_llcrypto::pk::curve25519::PublicKey;
use tunnel_llcrypto::pk::PeerId;

/// A BitTorrent infohash, naming a (hidden) swarm.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Return the bytes of this infohash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}
impl From<[u8; 20]> for InfoHash {
    fn from(b: [u8; 20]) -> Self {
        InfoHash(b)
    }
}
impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..]))
    }
}
impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", hex::encode(&self.0[..]))
    }
}
impl Readable for InfoHash {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(InfoHash(r.extract()?))
    }
}
impl Writeable for InfoHash {
    fn write_onto<B: Writer + ?Sized>(&self, w: &mut B) {
        w.write(&self.0);
    }
}

/// A rendezvous cookie, chosen by the client to pair two half-circuits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Cookie(u32);

impl From<u32> for Cookie {
    fn from(v: u32) -> Self {
        Cookie(v)
    }
}
impl From<Cookie> for u32 {
    fn from(c: Cookie) -> u32 {
        c.0
    }
}
impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A single parsed message, as found in a cell body.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CellMsg {
    /// Start a circuit.
    Create(Create),
    /// Answer to a Create.
    Created(Created),
    /// Extend a circuit by one hop.
    Extend(Extend),
    /// Answer to an Extend.
    Extended(Extended),
    /// Traffic for the terminal hop.
    Data(DataMsg),
    /// Tear down a circuit.
    Destroy(Destroy),
    /// Liveness probe.
    Ping(Ping),
    /// Answer to a Ping.
    Pong(Pong),
    /// Become an introduction point.
    EstablishIntro(EstablishIntro),
    /// Answer to an EstablishIntro.
    IntroEstablished,
    /// Rendezvous request from a client to a service.
    Intro(Intro),
    /// Register a rendezvous cookie.
    Rendezvous1(Rendezvous1),
    /// Answer to a Rendezvous1.
    RendezvousEstablished,
    /// Join a rendezvous cookie.
    Rendezvous2(Rendezvous2),
    /// End-to-end sealed hidden swarm traffic.
    DataHidden(DataHidden),
}

/// Internal: traits in common to the different message bodies.
pub trait Body: Sized {
    /// Convert this type into a CellMsg, wrapped appropriately.
    fn into_message(self) -> CellMsg;
    /// Decode a message body from a provided reader.
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self>;
    /// Encode the body of this message onto the end of a Vec.
    fn encode_onto(self, w: &mut Vec<u8>) -> Result<()>;
}

impl<B: Body> From<B> for CellMsg {
    fn from(b: B) -> CellMsg {
        b.into_message()
    }
}

impl CellMsg {
    /// Return the kind of cell that carries this message.
    pub fn kind(&self) -> CellKind {
        use CellMsg::*;
        match self {
            Create(_) => CellKind::CREATE,
            Created(_) => CellKind::CREATED,
            Extend(_) => CellKind::EXTEND,
            Extended(_) => CellKind::EXTENDED,
            Data(_) => CellKind::DATA,
            Destroy(_) => CellKind::DESTROY,
            Ping(_) => CellKind::PING,
            Pong(_) => CellKind::PONG,
            EstablishIntro(_) => CellKind::ESTABLISH_INTRO,
            IntroEstablished => CellKind::INTRO_ESTABLISHED,
            Intro(_) => CellKind::INTRO,
            Rendezvous1(_) => CellKind::RENDEZVOUS1,
            RendezvousEstablished => CellKind::RENDEZVOUS_ESTABLISHED,
            Rendezvous2(_) => CellKind::RENDEZVOUS2,
            DataHidden(_) => CellKind::DATA_HIDDEN,
        }
    }

    /// Encode the body of this message, not including kind or length.
    pub fn encode_body(self) -> crate::Result<Vec<u8>> {
        use CellMsg::*;
        let mut w = Vec::new();
        match self {
            Create(b) => b.encode_onto(&mut w)?,
            Created(b) => b.encode_onto(&mut w)?,
            Extend(b) => b.encode_onto(&mut w)?,
            Extended(b) => b.encode_onto(&mut w)?,
            Data(m) => w = m.encode()?,
            Destroy(b) => b.encode_onto(&mut w)?,
            Ping(b) => b.encode_onto(&mut w)?,
            Pong(b) => b.encode_onto(&mut w)?,
            EstablishIntro(b) => b.encode_onto(&mut w)?,
            IntroEstablished => (),
            Intro(b) => b.encode_onto(&mut w)?,
            Rendezvous1(b) => b.encode_onto(&mut w)?,
            RendezvousEstablished => (),
            Rendezvous2(b) => b.encode_onto(&mut w)?,
            DataHidden(b) => b.encode_onto(&mut w)?,
        }
        Ok(w)
    }

    /// Decode the cleartext body of a cell of kind `kind`.
    ///
    /// The whole body must be consumed.
    pub fn decode_body(kind: CellKind, body: &[u8]) -> crate::Result<Self> {
        if kind == CellKind::DATA {
            return Ok(CellMsg::Data(DataMsg::decode(body)?));
        }
        let mut r = Reader::from_slice(body);
        let msg = match kind {
            CellKind::CREATE => CellMsg::Create(Create::decode_from_reader(&mut r)?),
            CellKind::CREATED => CellMsg::Created(Created::decode_from_reader(&mut r)?),
            CellKind::EXTEND => CellMsg::Extend(Extend::decode_from_reader(&mut r)?),
            CellKind::EXTENDED => CellMsg::Extended(Extended::decode_from_reader(&mut r)?),
            CellKind::DESTROY => CellMsg::Destroy(Destroy::decode_from_reader(&mut r)?),
            CellKind::PING => CellMsg::Ping(Ping::decode_from_reader(&mut r)?),
            CellKind::PONG => CellMsg::Pong(Pong::decode_from_reader(&mut r)?),
            CellKind::ESTABLISH_INTRO => {
                CellMsg::EstablishIntro(EstablishIntro::decode_from_reader(&mut r)?)
            }
            CellKind::INTRO_ESTABLISHED => CellMsg::IntroEstablished,
            CellKind::INTRO => CellMsg::Intro(Intro::decode_from_reader(&mut r)?),
            CellKind::RENDEZVOUS1 => {
                CellMsg::Rendezvous1(Rendezvous1::decode_from_reader(&mut r)?)
            }
            CellKind::RENDEZVOUS_ESTABLISHED => CellMsg::RendezvousEstablished,
            CellKind::RENDEZVOUS2 => {
                CellMsg::Rendezvous2(Rendezvous2::decode_from_reader(&mut r)?)
            }
            CellKind::DATA_HIDDEN => CellMsg::DataHidden(DataHidden::decode_from_reader(&mut r)?),
            _ => return Err(crate::Error::UnrecognizedKind(kind)),
        };
        r.should_be_exhausted()?;
        Ok(msg)
    }
}

/// A Create message starts a circuit at its first hop.
///
/// It carries the originator's half of the handshake, addressed to the
/// receiving peer's long-term key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Create {
    /// Client handshake message.
    handshake: Vec<u8>,
}
impl Create {
    /// Make a new Create message.
    pub fn new<B: Into<Vec<u8>>>(handshake: B) -> Self {
        Create {
            handshake: handshake.into(),
        }
    }
    /// Return the client handshake message.
    pub fn handshake(&self) -> &[u8] {
        &self.handshake[..]
    }
}
impl Body for Create {
    fn into_message(self) -> CellMsg {
        CellMsg::Create(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Create::new(r.take_u16_prefixed()?))
    }
    fn encode_onto(self, w: &mut Vec<u8>) -> Result<()> {
        w.write_u16_prefixed(&self.handshake[..])
    }
}

/// A Created message answers a Create with the server's half of the
/// handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Created {
    /// Server handshake message.
    handshake: Vec<u8>,
}
impl Created {
    /// Make a new Created message.
    pub fn new<B: Into<Vec<u8>>>(handshake: B) -> Self {
        Created {
            handshake: handshake.into(),
        }
    }
    /// Return the server handshake message.
    pub fn handshake(&self) -> &[u8] {
        &self.handshake[..]
    }
    /// Consume this message and return the server handshake.
    pub fn into_handshake(self) -> Vec<u8> {
        self.handshake
    }
}
impl Body for Created {
    fn into_message(self) -> CellMsg {
        CellMsg::Created(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Created::new(r.take_u16_prefixed()?))
    }
    fn encode_onto(self, w: &mut Vec<u8>) -> Result<()> {
        w.write_u16_prefixed(&self.handshake[..])
    }
}

/// An Extend message asks the terminal hop to add `next` to the circuit.
///
/// The handshake is the originator's half, addressed to `next`; the
/// extending hop passes it on in a Create and never learns the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extend {
    /// Identity of the requested next hop.
    next: PeerId,
    /// Address at which to reach the next hop.
    addr: SocketAddr,
    /// Client handshake message for the next hop.
    handshake: Vec<u8>,
}
impl Extend {
    /// Make a new Extend message.
    pub fn new(next: PeerId, addr: SocketAddr, handshake: Vec<u8>) -> Self {
        Extend {
            next,
            addr,
            handshake,
        }
    }
    /// Return the identity of the requested next hop.
    pub fn next(&self) -> &PeerId {
        &self.next
    }
    /// Return the address of the requested next hop.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
    /// Return the client handshake message.
    pub fn handshake(&self) -> &[u8] {
        &self.handshake[..]
    }
}
impl Body for Extend {
    fn into_message(self) -> CellMsg {
        CellMsg::Extend(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let next = r.extract()?;
        let addr = r.extract()?;
        let handshake = r.take_u16_prefixed()?.into();
        Ok(Extend {
            next,
            addr,
            handshake,
        })
    }
    fn encode_onto(self, w: &mut Vec<u8>) -> Result<()> {
        w.write(&self.next);
        w.write(&self.addr);
        w.write_u16_prefixed(&self.handshake[..])
    }
}

/// An Extended message relays the new hop's Created back to the
/// originator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extended {
    /// Server handshake message from the new hop.
    handshake: Vec<u8>,
}
impl Extended {
    /// Make a new Extended message.
    pub fn new(handshake: Vec<u8>) -> Self {
        Extended { handshake }
    }
    /// Consume this message and return the server handshake.
    pub fn into_handshake(self) -> Vec<u8> {
        self.handshake
    }
}
impl Body for Extended {
    fn into_message(self) -> CellMsg {
        CellMsg::Extended(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Extended::new(r.take_u16_prefixed()?.into()))
    }
    fn encode_onto(self, w: &mut Vec<u8>) -> Result<()> {
        w.write_u16_prefixed(&self.handshake[..])
    }
}

caret_int! {
    /// Declared reason for tearing down a circuit.
    pub struct DestroyReason(u8) {
        /// No reason given.
        NONE = 0,
        /// Protocol violation.
        PROTOCOL = 1,
        /// Internal error.
        INTERNAL = 2,
        /// A timeout expired while building or using the circuit.
        TIMEOUT = 3,
        /// The circuit is no longer needed.
        FINISHED = 4,
        /// The hop refused to carry this traffic.
        POLICY = 5,
        /// Could not reach the requested next hop.
        CONNECTFAILED = 6,
    }
}

/// A Destroy message tears down a circuit, hop by hop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destroy {
    /// Reason code given for tearing down this circuit
    reason: DestroyReason,
}
impl Destroy {
    /// Create a new destroy message.
    pub fn new(reason: DestroyReason) -> Self {
        Destroy { reason }
    }
    /// Return the provided reason for destroying the circuit.
    pub fn reason(&self) -> DestroyReason {
        self.reason
    }
}
impl Body for Destroy {
    fn into_message(self) -> CellMsg {
        CellMsg::Destroy(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        // An empty body means NONE.
        let reason = if r.remaining() > 0 { r.take_u8()? } else { 0 };
        Ok(Destroy::new(reason.into()))
    }
    fn encode_onto(self, w: &mut Vec<u8>) -> Result<()> {
        w.write_u8(self.reason.into());
        Ok(())
    }
}

/// A Ping asks the terminal hop for a Pong with the same identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ping {
    /// Identifier echoed in the Pong.
    identifier: u16,
}
impl Ping {
    /// Make a new Ping.
    pub fn new(identifier: u16) -> Self {
        Ping { identifier }
    }
    /// Return the identifier of this ping.
    pub fn identifier(&self) -> u16 {
        self.identifier
    }
}
impl Body for Ping {
    fn into_message(self) -> CellMsg {
        CellMsg::Ping(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Ping::new(r.take_u16()?))
    }
    fn encode_onto(self, w: &mut Vec<u8>) -> Result<()> {
        w.write_u16(self.identifier);
        Ok(())
    }
}

/// Answer to a [`Ping`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pong {
    /// Identifier copied from the Ping.
    identifier: u16,
}
impl Pong {
    /// Make a new Pong.
    pub fn new(identifier: u16) -> Self {
        Pong { identifier }
    }
    /// Return the identifier of this pong.
    pub fn identifier(&self) -> u16 {
        self.identifier
    }
}
impl Body for Pong {
    fn into_message(self) -> CellMsg {
        CellMsg::Pong(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Pong::new(r.take_u16()?))
    }
    fn encode_onto(self, w: &mut Vec<u8>) -> Result<()> {
        w.write_u16(self.identifier);
        Ok(())
    }
}

/// An EstablishIntro asks the terminal hop to act as an introduction
/// point for `infohash` on behalf of the service holding `service_key`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EstablishIntro {
    /// The hidden swarm.
    infohash: InfoHash,
    /// The service's key for this swarm.
    service_key: PublicKey,
}
impl EstablishIntro {
    /// Make a new EstablishIntro.
    pub fn new(infohash: InfoHash, service_key: PublicKey) -> Self {
        EstablishIntro {
            infohash,
            service_key,
        }
    }
    /// Return the infohash being introduced.
    pub fn infohash(&self) -> &InfoHash {
        &self.infohash
    }
    /// Return the service key.
    pub fn service_key(&self) -> &PublicKey {
        &self.service_key
    }
}
impl Body for EstablishIntro {
    fn into_message(self) -> CellMsg {
        CellMsg::EstablishIntro(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let infohash = r.extract()?;
        let service_key = r.extract()?;
        Ok(EstablishIntro {
            infohash,
            service_key,
        })
    }
    fn encode_onto(self, w: &mut Vec<u8>) -> Result<()> {
        w.write(&self.infohash);
        w.write(&self.service_key);
        Ok(())
    }
}

/// An Intro carries a client's rendezvous request to a service, via the
/// service's introduction point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Intro {
    /// The hidden swarm the client wants.
    infohash: InfoHash,
    /// Identity of the rendezvous point.
    rendezvous: PeerId,
    /// Address of the rendezvous point.
    rendezvous_addr: SocketAddr,
    /// Cookie registered at the rendezvous point.
    cookie: Cookie,
    /// Client half of the end-to-end handshake, for the service key.
    handshake: Vec<u8>,
}
impl Intro {
    /// Make a new Intro.
    pub fn new(
        infohash: InfoHash,
        rendezvous: PeerId,
        rendezvous_addr: SocketAddr,
        cookie: Cookie,
        handshake: Vec<u8>,
    ) -> Self {
        Intro {
            infohash,
            rendezvous,
            rendezvous_addr,
            cookie,
            handshake,
        }
    }
    /// Return the infohash.
    pub fn infohash(&self) -> &InfoHash {
        &self.infohash
    }
    /// Return the rendezvous point's identity.
    pub fn rendezvous(&self) -> &PeerId {
        &self.rendezvous
    }
    /// Return the rendezvous point's address.
    pub fn rendezvous_addr(&self) -> SocketAddr {
        self.rendezvous_addr
    }
    /// Return the rendezvous cookie.
    pub fn cookie(&self) -> Cookie {
        self.cookie
    }
    /// Return the client handshake message.
    pub fn handshake(&self) -> &[u8] {
        &self.handshake[..]
    }
}
impl Body for Intro {
    fn into_message(self) -> CellMsg {
        CellMsg::Intro(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let infohash = r.extract()?;
        let rendezvous = r.extract()?;
        let rendezvous_addr = r.extract()?;
        let cookie = r.take_u32()?.into();
        let handshake = r.take_u16_prefixed()?.into();
        Ok(Intro {
            infohash,
            rendezvous,
            rendezvous_addr,
            cookie,
            handshake,
        })
    }
    fn encode_onto(self, w: &mut Vec<u8>) -> Result<()> {
        w.write(&self.infohash);
        w.write(&self.rendezvous);
        w.write(&self.rendezvous_addr);
        w.write_u32(self.cookie.into());
        w.write_u16_prefixed(&self.handshake[..])
    }
}

/// A Rendezvous1 registers a cookie at the terminal hop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rendezvous1 {
    /// The cookie to register.
    cookie: Cookie,
}
impl Rendezvous1 {
    /// Make a new Rendezvous1.
    pub fn new(cookie: Cookie) -> Self {
        Rendezvous1 { cookie }
    }
    /// Return the cookie.
    pub fn cookie(&self) -> Cookie {
        self.cookie
    }
}
impl Body for Rendezvous1 {
    fn into_message(self) -> CellMsg {
        CellMsg::Rendezvous1(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Rendezvous1::new(r.take_u32()?.into()))
    }
    fn encode_onto(self, w: &mut Vec<u8>) -> Result<()> {
        w.write_u32(self.cookie.into());
        Ok(())
    }
}

/// A Rendezvous2 joins a registered cookie, carrying the service's half
/// of the end-to-end handshake.  The rendezvous point passes it on to
/// the client unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rendezvous2 {
    /// The cookie being joined.
    cookie: Cookie,
    /// Server half of the end-to-end handshake.
    handshake: Vec<u8>,
}
impl Rendezvous2 {
    /// Make a new Rendezvous2.
    pub fn new(cookie: Cookie, handshake: Vec<u8>) -> Self {
        Rendezvous2 { cookie, handshake }
    }
    /// Return the cookie.
    pub fn cookie(&self) -> Cookie {
        self.cookie
    }
    /// Return the server handshake message.
    pub fn handshake(&self) -> &[u8] {
        &self.handshake[..]
    }
}
impl Body for Rendezvous2 {
    fn into_message(self) -> CellMsg {
        CellMsg::Rendezvous2(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let cookie = r.take_u32()?.into();
        let handshake = r.take_u16_prefixed()?.into();
        Ok(Rendezvous2 { cookie, handshake })
    }
    fn encode_onto(self, w: &mut Vec<u8>) -> Result<()> {
        w.write_u32(self.cookie.into());
        w.write_u16_prefixed(&self.handshake[..])
    }
}

/// End-to-end sealed traffic between a hidden swarm client and service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataHidden {
    /// The sealed datagram.
    sealed: Vec<u8>,
}
impl DataHidden {
    /// Make a new DataHidden message.
    pub fn new(sealed: Vec<u8>) -> Self {
        DataHidden { sealed }
    }
    /// Consume this message and return the sealed bytes.
    pub fn into_sealed(self) -> Vec<u8> {
        self.sealed
    }
}
impl Body for DataHidden {
    fn into_message(self) -> CellMsg {
        CellMsg::DataHidden(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let sealed = r.take_rest();
        if sealed.is_empty() {
            return Err(Error::BadMessage("empty hidden data"));
        }
        Ok(DataHidden::new(sealed.into()))
    }
    fn encode_onto(mut self, w: &mut Vec<u8>) -> Result<()> {
        w.append(&mut self.sealed);
        Ok(())
    }
}
